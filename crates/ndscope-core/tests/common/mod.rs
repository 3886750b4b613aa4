//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use ndscope_core::engine::{AllocationRequest, NativeArray};
use ndscope_core::error::{EngineError, EngineResult};
use ndscope_core::{HostEngine, ManagerRegistry, NativeEngine, NativeHandle, ParamBag};
use parking_lot::Mutex;

type InvokeHook = Box<dyn FnOnce() + Send>;

/// Host engine wrapper that records every release and can be told to fail
/// specific ones.
///
/// On top of the host operations it runs `split`, which returns `parts`
/// copies of its input, so multi-output invokes can be exercised.
pub struct RecordingEngine {
    host: HostEngine,
    order: Mutex<Vec<NativeHandle>>,
    calls: Mutex<HashMap<NativeHandle, usize>>,
    failing: Mutex<HashSet<NativeHandle>>,
    produced: Mutex<Vec<NativeHandle>>,
    after_invoke: Mutex<Option<InvokeHook>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingEngine {
            host: HostEngine::with_seed(42),
            order: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            produced: Mutex::new(Vec::new()),
            after_invoke: Mutex::new(None),
        })
    }

    /// Run `hook` once, after the next invoke has produced its outputs and
    /// before they are handed back
    pub fn after_next_invoke(&self, hook: impl FnOnce() + Send + 'static) {
        *self.after_invoke.lock() = Some(Box::new(hook));
    }

    /// Every handle returned by `invoke`, in order
    pub fn produced(&self) -> Vec<NativeHandle> {
        self.produced.lock().clone()
    }

    /// Make every release of `handle` fail without freeing it
    pub fn fail_release(&self, handle: NativeHandle) {
        self.failing.lock().insert(handle);
    }

    /// Handles in the order their release was requested
    pub fn release_order(&self) -> Vec<NativeHandle> {
        self.order.lock().clone()
    }

    /// How often release was called for `handle`
    pub fn release_calls(&self, handle: NativeHandle) -> usize {
        self.calls.lock().get(&handle).copied().unwrap_or(0)
    }

    /// Largest number of release calls seen for any single handle
    pub fn max_release_calls(&self) -> usize {
        self.calls.lock().values().copied().max().unwrap_or(0)
    }

    pub fn position(&self, handle: NativeHandle) -> Option<usize> {
        self.order.lock().iter().position(|h| *h == handle)
    }

    pub fn live_handles(&self) -> usize {
        self.host.live_handles()
    }

    pub fn allocated_count(&self) -> u64 {
        self.host.allocated_count()
    }
}

impl NativeEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn create(&self, request: &AllocationRequest) -> EngineResult<NativeHandle> {
        self.host.create(request)
    }

    fn release(&self, handle: NativeHandle) -> EngineResult<()> {
        self.order.lock().push(handle);
        *self.calls.lock().entry(handle).or_insert(0) += 1;
        if self.failing.lock().contains(&handle) {
            return Err(EngineError::release_failed(handle.0, "injected failure"));
        }
        self.host.release(handle)
    }

    fn read(&self, handle: NativeHandle) -> EngineResult<Vec<u8>> {
        self.host.read(handle)
    }

    fn supports(&self, operation: &str) -> bool {
        operation == "split" || self.host.supports(operation)
    }

    fn invoke(
        &self,
        operation: &str,
        inputs: &[NativeHandle],
        params: &ParamBag,
    ) -> EngineResult<Vec<NativeArray>> {
        let outputs = if operation == "split" {
            let parts = params
                .get_int("parts")
                .ok_or_else(|| EngineError::invalid_argument("split needs 'parts'"))?;
            let mut outputs = Vec::new();
            for _ in 0..parts {
                outputs.extend(self.host.invoke("copy", inputs, params)?);
            }
            outputs
        } else {
            self.host.invoke(operation, inputs, params)?
        };
        self.produced
            .lock()
            .extend(outputs.iter().map(|output| output.handle));

        let hook = self.after_invoke.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(outputs)
    }

    fn invoke_into(
        &self,
        operation: &str,
        inputs: &[NativeHandle],
        outputs: &[NativeHandle],
        params: &ParamBag,
    ) -> EngineResult<()> {
        self.host.invoke_into(operation, inputs, outputs, params)
    }
}

impl fmt::Debug for RecordingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingEngine")
            .field("host", &self.host)
            .field("releases", &self.order.lock().len())
            .finish()
    }
}

/// A registry over a fresh recording engine
pub fn setup() -> (Arc<RecordingEngine>, ManagerRegistry) {
    ndscope_core::telemetry::init_test_logging();
    let engine = RecordingEngine::new();
    let registry = ManagerRegistry::new(engine.clone());
    (engine, registry)
}
