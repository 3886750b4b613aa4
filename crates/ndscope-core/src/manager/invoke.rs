// Engine-specific operations
//
// Named operations with loosely typed parameters are passed through to the
// engine after a capability check. Outputs are attached like any other
// allocation.

use ndscope_error::{ManagerError, ManagerResult};
use tracing::{debug, warn};

use super::NDManager;
use crate::array::{NDArray, NDList};
use crate::engine::{NativeHandle, ParamBag};
use crate::resource::Resource;

impl NDManager {
    /// Run `operation` on `inputs`, attaching every output to this manager
    pub fn invoke(
        &self,
        operation: &str,
        inputs: &[&NDArray],
        params: &ParamBag,
    ) -> ManagerResult<NDList> {
        self.ensure_open(&self.lock())?;
        self.ensure_supported(operation)?;
        let handles = live_handles(inputs)?;

        let outputs = self.inner.engine.invoke(operation, &handles, params)?;
        debug!(manager = %self.inner.id, operation, outputs = outputs.len(), "invoked engine operation");

        let mut arrays = outputs
            .into_iter()
            .map(|native| NDArray::from_native(native, self.inner.engine.clone()));
        let mut list = NDList::new();
        while let Some(array) = arrays.next() {
            match self.track(array) {
                Ok(array) => list.push(array),
                Err(err) => {
                    // Closed mid-way: the rest were never attached
                    for rest in arrays.by_ref() {
                        if let Err(release_err) = rest.release() {
                            warn!(array = %rest.uid(), error = %release_err, "failed to release invoke output");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(list)
    }

    /// Run `operation` writing its results into existing arrays
    pub fn invoke_into(
        &self,
        operation: &str,
        inputs: &[&NDArray],
        outputs: &[&NDArray],
        params: &ParamBag,
    ) -> ManagerResult<()> {
        self.ensure_supported(operation)?;
        let inputs = live_handles(inputs)?;
        let outputs = live_handles(outputs)?;
        self.inner
            .engine
            .invoke_into(operation, &inputs, &outputs, params)?;
        Ok(())
    }

    fn ensure_supported(&self, operation: &str) -> ManagerResult<()> {
        if self.inner.engine.supports(operation) {
            Ok(())
        } else {
            Err(ManagerError::UnsupportedOperation {
                engine: self.inner.engine.name().to_string(),
                operation: operation.to_string(),
            })
        }
    }
}

fn live_handles(arrays: &[&NDArray]) -> ManagerResult<Vec<NativeHandle>> {
    arrays
        .iter()
        .map(|array| array.ensure_live().map(|_| array.handle()))
        .collect()
}
