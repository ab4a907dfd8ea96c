//! Cross-Runtime Bridge (spec §4.13): a parity `spawn`/`terminate`/
//! `status`/`list` surface for a separate native runtime, layered over
//! the same `HypervisorManager` instance the Rust side uses directly.
//! A VM is observable through the bridge only while its id is in
//! scope; the manager itself has no notion of scope, so any VM spawned
//! through either entry point is trivially visible to the other once
//! in scope, satisfying the parity requirement.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use hyperforge_hypervisor::HypervisorManager;
use hyperforge_types::vm::{Provider, VmInstance, VmSpec};
use hyperforge_types::{HyperforgeError, Result};

/// `{allowed_providers, allowed_vm_ids, max_vms}` from spec §4.13.
/// `allowed_vm_ids` grows automatically as the bridge spawns VMs;
/// externally-spawned VMs can be brought into scope with
/// [`CrossRuntimeBridge::allow_vm_id`].
#[derive(Debug, Clone)]
pub struct BridgeScope {
    pub allowed_providers: HashSet<Provider>,
    pub allowed_vm_ids: HashSet<String>,
    pub max_vms: usize,
}

impl BridgeScope {
    pub fn new(allowed_providers: impl IntoIterator<Item = Provider>, max_vms: usize) -> Self {
        Self {
            allowed_providers: allowed_providers.into_iter().collect(),
            allowed_vm_ids: HashSet::new(),
            max_vms,
        }
    }
}

pub struct CrossRuntimeBridge {
    hvm: Arc<HypervisorManager>,
    scope: RwLock<BridgeScope>,
}

impl CrossRuntimeBridge {
    pub fn new(hvm: Arc<HypervisorManager>, scope: BridgeScope) -> Self {
        Self {
            hvm,
            scope: RwLock::new(scope),
        }
    }

    /// Brings an already-running VM (spawned outside the bridge, e.g.
    /// directly through the manager) into scope.
    pub fn allow_vm_id(&self, vm_id: &str) {
        self.scope.write().unwrap().allowed_vm_ids.insert(vm_id.to_string());
    }

    fn in_scope(&self, vm_id: &str, provider: Provider) -> bool {
        let scope = self.scope.read().unwrap();
        scope.allowed_providers.contains(&provider) && scope.allowed_vm_ids.contains(vm_id)
    }

    fn out_of_scope(vm_id: &str) -> HyperforgeError {
        HyperforgeError::PolicyDenied(format!("vm `{vm_id}` is outside bridge scope"))
    }

    pub fn spawn(&self, spec: VmSpec) -> Result<String> {
        {
            let scope = self.scope.read().unwrap();
            if !scope.allowed_providers.contains(&spec.provider) {
                return Err(HyperforgeError::PolicyDenied(format!(
                    "provider `{}` is outside bridge scope",
                    spec.provider
                )));
            }
            if scope.allowed_vm_ids.len() >= scope.max_vms {
                return Err(HyperforgeError::MaxVmsExceeded { max: scope.max_vms });
            }
        }
        let vm_id = self.hvm.spawn(spec)?;
        self.scope.write().unwrap().allowed_vm_ids.insert(vm_id.clone());
        Ok(vm_id)
    }

    pub fn terminate(&self, vm_id: &str, reason: &str) -> Result<()> {
        let instance = self.hvm.get_status(vm_id)?;
        if !self.in_scope(vm_id, instance.provider) {
            return Err(Self::out_of_scope(vm_id));
        }
        self.hvm.terminate(vm_id, reason)
    }

    pub fn status(&self, vm_id: &str) -> Result<VmInstance> {
        let instance = self.hvm.get_status(vm_id)?;
        if !self.in_scope(vm_id, instance.provider) {
            return Err(Self::out_of_scope(vm_id));
        }
        Ok(instance)
    }

    pub fn list(&self) -> Vec<VmInstance> {
        let scope = self.scope.read().unwrap();
        self.hvm
            .list_vms()
            .into_iter()
            .filter(|i| scope.allowed_providers.contains(&i.provider) && scope.allowed_vm_ids.contains(&i.id))
            .collect()
    }
}
