use crate::config::DebugSettings;
use crate::csr::CommandStreamReceiver;
use crate::csr::simulated::{EngineMode, SimulatedEngine, SimulatedGpu};
use crate::csr::submission::SubmissionBackend;
use crate::error::NeoResult;
use crate::memory::manager::{EngineType, MemoryConfig, MemoryManager};
use crate::queue::{CommandQueue, QueueBuilder};
use crate::svm::SvmAllocsManager;
use log::info;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ===============================================================================================
// Environment Structures
// ===============================================================================================

#[derive(Debug)]
struct Engine {
    csr: Arc<CommandStreamReceiver>,
    /// Set when the engine runs on the in-process GPU.
    simulated: Option<Arc<SimulatedEngine>>,
}

/// Everything one device needs: settings, memory, the SVM directory and the
/// engines with their command stream receivers.
///
/// Created explicitly and handed to whoever needs it. Engines are torn down
/// before the SVM directory, which goes before the memory manager.
#[derive(Debug)]
pub struct ExecutionEnvironment {
    engines: Mutex<Vec<Engine>>,
    svm: Arc<SvmAllocsManager>,
    memory_manager: Arc<MemoryManager>,
    gpu: Arc<SimulatedGpu>,
    engine_mode: EngineMode,
    settings: Arc<DebugSettings>,
}

impl ExecutionEnvironment {
    /// Environment whose engines execute batches as they are submitted.
    #[must_use]
    pub fn new(settings: DebugSettings, memory_config: MemoryConfig) -> Self {
        Self::with_engine_mode(settings, memory_config, EngineMode::Immediate)
    }

    #[must_use]
    pub fn with_engine_mode(settings: DebugSettings, mut memory_config: MemoryConfig, engine_mode: EngineMode) -> Self {
        memory_config.local_memory_supported |= settings.enable_local_memory;
        let memory_manager = MemoryManager::new(memory_config);
        info!(
            "[ExecutionEnvironment] {} MB device memory, local memory {}, engines {engine_mode:?}",
            memory_config.capacity >> 20,
            if memory_config.local_memory_supported { "on" } else { "off" }
        );
        Self {
            engines: Mutex::new(Vec::new()),
            svm: Arc::new(SvmAllocsManager::new(memory_manager.clone())),
            memory_manager,
            gpu: SimulatedGpu::new(),
            engine_mode,
            settings: Arc::new(settings),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Engine>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn settings(&self) -> &Arc<DebugSettings> {
        &self.settings
    }

    #[must_use]
    pub const fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    #[must_use]
    pub const fn svm(&self) -> &Arc<SvmAllocsManager> {
        &self.svm
    }

    #[must_use]
    pub const fn gpu(&self) -> &Arc<SimulatedGpu> {
        &self.gpu
    }

    // ===========================================================================================
    // Engines
    // ===========================================================================================

    /// Creates an engine on the in-process GPU and its receiver.
    ///
    /// # Errors
    /// `Unrecoverable` when the receiver cannot allocate its tag buffer.
    pub fn create_engine(&self, engine_type: EngineType) -> NeoResult<Arc<CommandStreamReceiver>> {
        let engine = self.gpu.create_engine(self.engine_mode)?;
        let csr = self.create_receiver(engine_type, engine.clone())?;
        self.lock().push(Engine {
            csr: csr.clone(),
            simulated: Some(engine),
        });
        Ok(csr)
    }

    /// Creates a receiver submitting to `backend` instead of the in-process GPU.
    pub fn create_engine_with_backend(
        &self,
        engine_type: EngineType,
        backend: Arc<dyn SubmissionBackend>,
    ) -> NeoResult<Arc<CommandStreamReceiver>> {
        let csr = self.create_receiver(engine_type, backend)?;
        self.lock().push(Engine {
            csr: csr.clone(),
            simulated: None,
        });
        Ok(csr)
    }

    fn create_receiver(
        &self,
        engine_type: EngineType,
        backend: Arc<dyn SubmissionBackend>,
    ) -> NeoResult<Arc<CommandStreamReceiver>> {
        Ok(Arc::new(CommandStreamReceiver::new(
            self.memory_manager.clone(),
            engine_type,
            0,
            backend,
            self.settings.clone(),
        )?))
    }

    /// The in-process engine behind the receiver with `context_id`.
    #[must_use]
    pub fn simulated_engine(&self, context_id: u32) -> Option<Arc<SimulatedEngine>> {
        self.lock()
            .iter()
            .find(|engine| engine.csr.os_context().context_id() == context_id)
            .and_then(|engine| engine.simulated.clone())
    }

    #[must_use]
    pub fn engines(&self) -> Vec<Arc<CommandStreamReceiver>> {
        self.lock().iter().map(|engine| engine.csr.clone()).collect()
    }

    /// First compute engine, created on demand.
    pub fn default_engine(&self) -> NeoResult<Arc<CommandStreamReceiver>> {
        let existing = self
            .lock()
            .iter()
            .find(|engine| engine.csr.os_context().engine_type() == EngineType::Compute)
            .map(|engine| engine.csr.clone());
        match existing {
            Some(csr) => Ok(csr),
            None => self.create_engine(EngineType::Compute),
        }
    }

    /// Queue builder on `csr` sharing this environment's SVM directory and settings.
    #[must_use]
    pub fn create_queue(&self, csr: Arc<CommandStreamReceiver>) -> QueueBuilder {
        CommandQueue::builder(csr, self.svm.clone(), self.settings.clone())
    }
}
