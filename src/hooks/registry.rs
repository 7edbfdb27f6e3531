//! Process-wide binding of hook identifiers to payload and result types.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::OnceLock;

use super::{register_builtin_hooks, Hook, HookType};
use crate::error::HookError;
use crate::plugin::schema::PluginResult;

/// A concrete Rust type bound to a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundType {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl BoundType {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }
}

impl fmt::Display for BoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HookBinding {
    payload: BoundType,
    result: BoundType,
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    bindings: DashMap<HookType, HookBinding>,
}

static HOOK_REGISTRY: OnceLock<HookRegistry> = OnceLock::new();

/// The single registry shared by the whole process. Built-in hooks are bound
/// on first access.
pub fn hook_registry() -> &'static HookRegistry {
    HOOK_REGISTRY.get_or_init(|| {
        let registry = HookRegistry::new();
        register_builtin_hooks(&registry);
        registry
    })
}

impl HookRegistry {
    /// An empty registry. Most callers want [`hook_registry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `hook` to payload type `P` and result type `R`.
    ///
    /// Registering the same pair twice is a no-op; a different pair fails.
    pub fn register<P: 'static, R: 'static>(&self, hook: HookType) -> Result<(), HookError> {
        let binding = HookBinding {
            payload: BoundType::of::<P>(),
            result: BoundType::of::<R>(),
        };

        match self.bindings.entry(hook) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                if *entry.get() == binding {
                    Ok(())
                } else {
                    Err(HookError::Conflict {
                        hook: entry.key().to_string(),
                        existing: format!("({}, {})", entry.get().payload, entry.get().result),
                        requested: format!("({}, {})", binding.payload, binding.result),
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                tracing::debug!(
                    hook = %entry.key(),
                    payload = binding.payload.type_name,
                    "Registered hook type"
                );
                entry.insert(binding);
                Ok(())
            }
        }
    }

    /// Binds a hook marker to its payload and `PluginResult<Payload>`.
    pub fn register_hook<H: Hook>(&self) -> Result<(), HookError> {
        self.register::<H::Payload, PluginResult<H::Payload>>(H::hook_type())
    }

    pub fn is_registered(&self, hook: &HookType) -> bool {
        self.bindings.contains_key(hook)
    }

    pub fn payload_type(&self, hook: &HookType) -> Result<BoundType, HookError> {
        self.binding(hook).map(|b| b.payload)
    }

    pub fn result_type(&self, hook: &HookType) -> Result<BoundType, HookError> {
        self.binding(hook).map(|b| b.result)
    }

    /// Decodes wire JSON into the payload type bound to `hook`.
    pub fn decode_payload<P>(&self, hook: &HookType, raw: Value) -> Result<P, HookError>
    where
        P: DeserializeOwned + 'static,
    {
        let bound = self.payload_type(hook)?;
        Self::decode(hook, bound, raw)
    }

    /// Decodes wire JSON into the result type bound to `hook`.
    pub fn decode_result<R>(&self, hook: &HookType, raw: Value) -> Result<R, HookError>
    where
        R: DeserializeOwned + 'static,
    {
        let bound = self.result_type(hook)?;
        Self::decode(hook, bound, raw)
    }

    /// Registered hook identifiers, sorted.
    pub fn registered_hooks(&self) -> Vec<HookType> {
        let mut hooks: Vec<HookType> = self.bindings.iter().map(|e| e.key().clone()).collect();
        hooks.sort();
        hooks
    }

    fn binding(&self, hook: &HookType) -> Result<HookBinding, HookError> {
        self.bindings
            .get(hook)
            .map(|b| *b)
            .ok_or_else(|| HookError::NotRegistered(hook.to_string()))
    }

    fn decode<T>(hook: &HookType, bound: BoundType, raw: Value) -> Result<T, HookError>
    where
        T: DeserializeOwned + 'static,
    {
        if bound.type_id != TypeId::of::<T>() {
            return Err(HookError::TypeMismatch {
                hook: hook.to_string(),
                expected: bound.type_name.to_string(),
                requested: type_name::<T>().to_string(),
            });
        }
        serde_json::from_value(raw).map_err(|source| HookError::Decode {
            hook: hook.to_string(),
            source,
        })
    }
}
