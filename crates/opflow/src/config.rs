//! Escalation configuration and the three-tier override resolver.
//!
//! One global entry (thresholds plus per-level enable flags) can be
//! overridden per operation type and per component. Resolution coalesces by
//! field, never by whole object: precedence is component > operation-type >
//! global, and a field left unset at a higher layer falls through to the
//! next lower one.
//!
//! Only the *global* layer is validated. Partial overrides are stored as-is
//! and are only checked once merged into a full entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Duration thresholds (milliseconds) at which an operation's feedback
/// escalates, plus an optional hard timeout.
///
/// Invariant: `inline_threshold_ms < overlay_threshold_ms <
/// modal_threshold_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Elapsed time before an inline indicator is shown.
    pub inline_threshold_ms: u64,
    /// Elapsed time before an overlay is shown.
    pub overlay_threshold_ms: u64,
    /// Elapsed time before a blocking modal is shown.
    pub modal_threshold_ms: u64,
    /// Elapsed time after which the operation is force-failed, if set.
    pub timeout_ms: Option<u64>,
}

impl EscalationConfig {
    /// Check the threshold ordering invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inline_threshold_ms < self.overlay_threshold_ms
            && self.overlay_threshold_ms < self.modal_threshold_ms
        {
            Ok(())
        } else {
            Err(ConfigError::InvalidThresholds {
                inline: self.inline_threshold_ms,
                overlay: self.overlay_threshold_ms,
                modal: self.modal_threshold_ms,
            })
        }
    }
}

impl Default for EscalationConfig {
    /// Default thresholds: inline 200ms, overlay 1000ms, modal 3000ms,
    /// no timeout.
    fn default() -> Self {
        Self {
            inline_threshold_ms: 200,
            overlay_threshold_ms: 1000,
            modal_threshold_ms: 3000,
            timeout_ms: None,
        }
    }
}

/// A full configuration entry: thresholds plus an enable flag per
/// escalation level. Disabled levels never arm their timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationEntry {
    pub config: EscalationConfig,
    pub inline_enabled: bool,
    pub overlay_enabled: bool,
    pub modal_enabled: bool,
}

impl Default for EscalationEntry {
    fn default() -> Self {
        Self {
            config: EscalationConfig::default(),
            inline_enabled: true,
            overlay_enabled: true,
            modal_enabled: true,
        }
    }
}

/// A partial configuration: every field optional. Defined fields overwrite
/// the layer below when merged; unset fields fall through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationOverride {
    pub inline_threshold_ms: Option<u64>,
    pub overlay_threshold_ms: Option<u64>,
    pub modal_threshold_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub inline_enabled: Option<bool>,
    pub overlay_enabled: Option<bool>,
    pub modal_enabled: Option<bool>,
}

impl EscalationOverride {
    /// Apply the defined fields of this override onto `entry`.
    pub fn merge_into(&self, entry: &mut EscalationEntry) {
        if let Some(v) = self.inline_threshold_ms {
            entry.config.inline_threshold_ms = v;
        }
        if let Some(v) = self.overlay_threshold_ms {
            entry.config.overlay_threshold_ms = v;
        }
        if let Some(v) = self.modal_threshold_ms {
            entry.config.modal_threshold_ms = v;
        }
        if let Some(v) = self.timeout_ms {
            entry.config.timeout_ms = Some(v);
        }
        if let Some(v) = self.inline_enabled {
            entry.inline_enabled = v;
        }
        if let Some(v) = self.overlay_enabled {
            entry.overlay_enabled = v;
        }
        if let Some(v) = self.modal_enabled {
            entry.modal_enabled = v;
        }
    }
}

/// Serializable export of the full three-layer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverSnapshot {
    pub global: EscalationEntry,
    pub operation_types: HashMap<String, EscalationOverride>,
    pub components: HashMap<String, EscalationOverride>,
}

/// Three-tier configuration resolver: global defaults, per-operation-type
/// overrides, per-component overrides.
#[derive(Debug, Clone, Default)]
pub struct EscalationResolver {
    global: EscalationEntry,
    operation_types: HashMap<String, EscalationOverride>,
    components: HashMap<String, EscalationOverride>,
}

impl EscalationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current global entry.
    pub fn global(&self) -> &EscalationEntry {
        &self.global
    }

    /// Merge `partial` into the global entry.
    ///
    /// The *merged* result is validated against the threshold ordering
    /// invariant; on violation the stored global is left untouched.
    pub fn set_global(&mut self, partial: EscalationOverride) -> Result<(), ConfigError> {
        let mut merged = self.global;
        partial.merge_into(&mut merged);
        merged.config.validate()?;
        self.global = merged;
        Ok(())
    }

    /// Store a per-operation-type override. Not validated until resolved.
    pub fn set_operation_type(&mut self, operation_type: impl Into<String>, partial: EscalationOverride) {
        self.operation_types.insert(operation_type.into(), partial);
    }

    /// Store a per-component override. Not validated until resolved.
    pub fn set_component(&mut self, component_id: impl Into<String>, partial: EscalationOverride) {
        self.components.insert(component_id.into(), partial);
    }

    /// Resolve the entry in effect for an (operation type, component) pair.
    ///
    /// Starts from the global entry, merges the operation-type override if
    /// one is stored, then the component override last; component fields win
    /// over both.
    pub fn resolve(
        &self,
        operation_type: Option<&str>,
        component_id: Option<&str>,
    ) -> EscalationEntry {
        let mut entry = self.global;
        if let Some(partial) = operation_type.and_then(|ty| self.operation_types.get(ty)) {
            partial.merge_into(&mut entry);
        }
        if let Some(partial) = component_id.and_then(|id| self.components.get(id)) {
            partial.merge_into(&mut entry);
        }
        entry
    }

    /// Export all three layers for persistence.
    pub fn export(&self) -> ResolverSnapshot {
        ResolverSnapshot {
            global: self.global,
            operation_types: self.operation_types.clone(),
            components: self.components.clone(),
        }
    }

    /// Restore all three layers from a snapshot.
    ///
    /// The global layer is re-validated through the same path as
    /// [`set_global`](Self::set_global); on violation nothing is imported.
    pub fn import(&mut self, snapshot: ResolverSnapshot) -> Result<(), ConfigError> {
        snapshot.global.config.validate()?;
        self.global = snapshot.global;
        self.operation_types = snapshot.operation_types;
        self.components = snapshot.components;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn override_with(
        inline: Option<u64>,
        overlay: Option<u64>,
        modal: Option<u64>,
    ) -> EscalationOverride {
        EscalationOverride {
            inline_threshold_ms: inline,
            overlay_threshold_ms: overlay,
            modal_threshold_ms: modal,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_global_is_valid() {
        assert!(EscalationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_set_global_merges_partial_fields() {
        let mut resolver = EscalationResolver::new();
        resolver
            .set_global(override_with(None, None, Some(5000)))
            .unwrap();

        let global = resolver.global();
        assert_eq!(global.config.inline_threshold_ms, 200);
        assert_eq!(global.config.overlay_threshold_ms, 1000);
        assert_eq!(global.config.modal_threshold_ms, 5000);
    }

    #[test]
    fn test_set_global_rejects_inverted_ordering() {
        let mut resolver = EscalationResolver::new();

        // inline >= overlay
        let err = resolver.set_global(override_with(Some(1000), None, None));
        assert!(err.is_err());
        // overlay >= modal
        let err = resolver.set_global(override_with(None, Some(3000), None));
        assert!(err.is_err());

        // Rejection must not have mutated stored state.
        assert_eq!(resolver.global().config, EscalationConfig::default());
    }

    #[test]
    fn test_resolve_precedence_component_over_type_over_global() {
        let mut resolver = EscalationResolver::new();
        resolver
            .set_global(override_with(None, None, Some(2000)))
            .unwrap();
        resolver.set_operation_type("network", override_with(Some(100), None, None));
        resolver.set_component("fe", override_with(None, Some(1000), None));

        let entry = resolver.resolve(Some("network"), Some("fe"));
        assert_eq!(entry.config.inline_threshold_ms, 100);
        assert_eq!(entry.config.overlay_threshold_ms, 1000);
        assert_eq!(entry.config.modal_threshold_ms, 2000);
    }

    #[test]
    fn test_resolve_component_wins_over_operation_type_per_field() {
        let mut resolver = EscalationResolver::new();
        resolver.set_operation_type("network", override_with(Some(100), Some(800), None));
        resolver.set_component("fe", override_with(Some(50), None, None));

        let entry = resolver.resolve(Some("network"), Some("fe"));
        // Component defines inline, wins; overlay falls through to the type.
        assert_eq!(entry.config.inline_threshold_ms, 50);
        assert_eq!(entry.config.overlay_threshold_ms, 800);
    }

    #[test]
    fn test_resolve_without_scope_returns_global() {
        let resolver = EscalationResolver::new();
        assert_eq!(resolver.resolve(None, None), EscalationEntry::default());
    }

    #[test]
    fn test_resolve_unknown_scope_falls_back_to_global() {
        let resolver = EscalationResolver::new();
        let entry = resolver.resolve(Some("nope"), Some("missing"));
        assert_eq!(entry, EscalationEntry::default());
    }

    #[test]
    fn test_enable_flags_merge() {
        let mut resolver = EscalationResolver::new();
        resolver.set_component(
            "quiet",
            EscalationOverride {
                modal_enabled: Some(false),
                ..Default::default()
            },
        );

        let entry = resolver.resolve(None, Some("quiet"));
        assert!(entry.inline_enabled);
        assert!(!entry.modal_enabled);
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut resolver = EscalationResolver::new();
        resolver
            .set_global(override_with(Some(150), None, None))
            .unwrap();
        resolver.set_operation_type("disk", override_with(None, Some(900), None));
        resolver.set_component("sidebar", override_with(Some(50), None, None));

        let snapshot = resolver.export();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: ResolverSnapshot = serde_json::from_str(&json).unwrap();

        let mut other = EscalationResolver::new();
        other.import(restored).unwrap();
        assert_eq!(
            other.resolve(Some("disk"), Some("sidebar")),
            resolver.resolve(Some("disk"), Some("sidebar"))
        );
    }

    #[test]
    fn test_import_rejects_invalid_global() {
        let snapshot = ResolverSnapshot {
            global: EscalationEntry {
                config: EscalationConfig {
                    inline_threshold_ms: 500,
                    overlay_threshold_ms: 400,
                    modal_threshold_ms: 3000,
                    timeout_ms: None,
                },
                ..Default::default()
            },
            ..Default::default()
        };

        let mut resolver = EscalationResolver::new();
        assert!(resolver.import(snapshot).is_err());
        assert_eq!(resolver.global().config, EscalationConfig::default());
    }

    #[test]
    fn test_timeout_merges_through_layers() {
        let mut resolver = EscalationResolver::new();
        resolver.set_operation_type(
            "network",
            EscalationOverride {
                timeout_ms: Some(30_000),
                ..Default::default()
            },
        );

        let entry = resolver.resolve(Some("network"), None);
        assert_eq!(entry.config.timeout_ms, Some(30_000));
        assert_eq!(resolver.resolve(None, None).config.timeout_ms, None);
    }
}
