use crate::csr::CommandStreamReceiver;
use crate::memory::AllocationType;
use crate::tags::{TagNode, TagPayload, TagRecord};

/// Value the engine overwrites once a timestamp is captured.
pub const TIMESTAMP_NOT_WRITTEN: u32 = 1;

/// Per-enqueue timestamp record the engine writes at start and end of work.
///
/// Other engines wait on `context_end` through semaphores; the implicit
/// dependency counter keeps the record alive until those waits retire.
#[derive(Debug)]
pub struct TimestampPacketStorage;

impl TimestampPacketStorage {
    pub const PACKET_COUNT: usize = 1;

    const CONTEXT_START: usize = 0;
    const GLOBAL_START: usize = 1;
    const CONTEXT_END: usize = 2;
    const GLOBAL_END: usize = 3;
    const PACKETS_USED: usize = Self::PACKET_COUNT * 4;
    const IMPLICIT_DEPENDENCIES: usize = Self::PACKETS_USED + 1;

    #[must_use]
    pub const fn context_start_offset(packet: usize) -> usize {
        (packet * 4 + Self::CONTEXT_START) * 4
    }

    #[must_use]
    pub const fn global_start_offset(packet: usize) -> usize {
        (packet * 4 + Self::GLOBAL_START) * 4
    }

    #[must_use]
    pub const fn context_end_offset(packet: usize) -> usize {
        (packet * 4 + Self::CONTEXT_END) * 4
    }

    #[must_use]
    pub const fn global_end_offset(packet: usize) -> usize {
        (packet * 4 + Self::GLOBAL_END) * 4
    }

    #[must_use]
    pub const fn implicit_dependencies_offset() -> usize {
        Self::IMPLICIT_DEPENDENCIES * 4
    }

    fn packets_used(record: &TagRecord) -> usize {
        (record.load(Self::PACKETS_USED) as usize).clamp(1, Self::PACKET_COUNT)
    }

    fn is_completed(record: &TagRecord) -> bool {
        (0..Self::packets_used(record)).all(|packet| {
            record.load(packet * 4 + Self::CONTEXT_END) != TIMESTAMP_NOT_WRITTEN
                && record.load(packet * 4 + Self::GLOBAL_END) != TIMESTAMP_NOT_WRITTEN
        })
    }
}

impl TagPayload for TimestampPacketStorage {
    const RECORD_SIZE: usize = (Self::PACKET_COUNT * 4 + 2) * 4;
    const ALLOCATION_TYPE: AllocationType = AllocationType::TimestampPacketTagBuffer;

    fn initialize(record: &TagRecord) {
        for dword in 0..Self::PACKET_COUNT * 4 {
            record.store(dword, TIMESTAMP_NOT_WRITTEN);
        }
        record.store(Self::PACKETS_USED, 1);
        record.store(Self::IMPLICIT_DEPENDENCIES, 0);
    }

    fn can_be_released(record: &TagRecord) -> bool {
        Self::is_completed(record) && record.load(Self::IMPLICIT_DEPENDENCIES) == 0
    }
}

impl TagNode<TimestampPacketStorage> {
    /// True once every used packet has its end timestamps written.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        TimestampPacketStorage::is_completed(self.record())
    }

    /// Registers one more engine-side wait on this record.
    pub fn increment_implicit_dependencies(&self) {
        self.record()
            .dword(TimestampPacketStorage::IMPLICIT_DEPENDENCIES)
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    /// Marks the packet done for work that will never reach an engine.
    pub fn abandon(&self) {
        for packet in 0..TimestampPacketStorage::PACKET_COUNT {
            self.record().store(packet * 4 + TimestampPacketStorage::CONTEXT_END, 0);
            self.record().store(packet * 4 + TimestampPacketStorage::GLOBAL_END, 0);
        }
    }

    #[must_use]
    pub fn implicit_dependencies(&self) -> u32 {
        self.record().load(TimestampPacketStorage::IMPLICIT_DEPENDENCIES)
    }

    #[must_use]
    pub fn context_start(&self, packet: usize) -> u32 {
        self.record().load(packet * 4 + TimestampPacketStorage::CONTEXT_START)
    }

    #[must_use]
    pub fn context_end(&self, packet: usize) -> u32 {
        self.record().load(packet * 4 + TimestampPacketStorage::CONTEXT_END)
    }

    #[must_use]
    pub fn global_start(&self, packet: usize) -> u32 {
        self.record().load(packet * 4 + TimestampPacketStorage::GLOBAL_START)
    }

    #[must_use]
    pub fn global_end(&self, packet: usize) -> u32 {
        self.record().load(packet * 4 + TimestampPacketStorage::GLOBAL_END)
    }
}

/// Profiling record written around a kernel when the queue has profiling on.
#[derive(Debug)]
pub struct HwTimeStamps;

impl HwTimeStamps {
    const GLOBAL_START: usize = 0;
    const CONTEXT_START: usize = 1;
    const GLOBAL_END: usize = 2;
    const CONTEXT_END: usize = 3;

    #[must_use]
    pub const fn global_start_offset() -> usize {
        Self::GLOBAL_START * 4
    }

    #[must_use]
    pub const fn context_start_offset() -> usize {
        Self::CONTEXT_START * 4
    }

    #[must_use]
    pub const fn global_end_offset() -> usize {
        Self::GLOBAL_END * 4
    }

    #[must_use]
    pub const fn context_end_offset() -> usize {
        Self::CONTEXT_END * 4
    }
}

impl TagPayload for HwTimeStamps {
    const RECORD_SIZE: usize = 16;
    const ALLOCATION_TYPE: AllocationType = AllocationType::ProfilingTagBuffer;

    fn initialize(record: &TagRecord) {
        for dword in 0..4 {
            record.store(dword, 0);
        }
    }

    fn can_be_released(_record: &TagRecord) -> bool {
        true
    }
}

impl TagNode<HwTimeStamps> {
    /// `(context_start, context_end)`; zero until written.
    #[must_use]
    pub fn context_range(&self) -> (u32, u32) {
        (
            self.record().load(HwTimeStamps::CONTEXT_START),
            self.record().load(HwTimeStamps::CONTEXT_END),
        )
    }

    #[must_use]
    pub fn global_range(&self) -> (u32, u32) {
        (
            self.record().load(HwTimeStamps::GLOBAL_START),
            self.record().load(HwTimeStamps::GLOBAL_END),
        )
    }
}

/// Timestamp packets one enqueue produced or depends on.
#[derive(Debug, Default)]
pub struct TimestampPacketContainer {
    nodes: Vec<TagNode<TimestampPacketStorage>>,
}

impl TimestampPacketContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: TagNode<TimestampPacketStorage>) {
        self.nodes.push(node);
    }

    #[must_use]
    pub fn peek_nodes(&self) -> &[TagNode<TimestampPacketStorage>] {
        &self.nodes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Adds clones of every node in `other`.
    pub fn assign_and_increment_refs(&mut self, other: &Self) {
        self.nodes.extend(other.nodes.iter().cloned());
    }

    /// Moves all nodes of `other` into `self`, leaving `other` empty.
    pub fn assign_and_clear(&mut self, other: &mut Self) {
        self.nodes.append(&mut other.nodes);
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.nodes, &mut other.nodes);
    }

    /// Drops completed nodes, or every node when `clear_all` is set.
    pub fn resolve_dependencies(&mut self, clear_all: bool) {
        self.nodes.retain(|node| !clear_all && !node.is_completed());
    }

    pub fn make_resident(&self, csr: &CommandStreamReceiver) {
        for node in &self.nodes {
            csr.make_resident(node.allocation());
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.nodes.iter().all(|node| node.is_completed())
    }
}
