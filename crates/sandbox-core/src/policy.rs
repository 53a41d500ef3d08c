//! Restriction policies and the demands checked against them.
//!
//! A [`RestrictionPolicy`] is a caller-assembled set of
//! `(CapabilityKind, RestrictionValue)` pairs. Sensitive operations express
//! what they need as a [`Demand`]; the policy either permits it or not.
//! Anything not configured is denied.
//!
//! ## TOML form
//!
//! ```toml
//! [policy]
//! file_io = "granted"
//! reflection = ["member_access", "type_information"]
//! zone_identity = "internet"
//! # or: unrestricted = true
//! ```

use crate::capability::{
    CapabilityKind, GrantState, ReflectionFlags, RestrictionValue, SecurityFlags, SecurityZone,
};
use crate::catalog::CapabilityCatalog;
use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Something an operation requires from the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub kind: CapabilityKind,
    pub required: RestrictionValue,
}

impl Demand {
    /// Demand that a tri-state capability is granted.
    pub fn granted(kind: CapabilityKind) -> Self {
        Self {
            kind,
            required: RestrictionValue::State(GrantState::Granted),
        }
    }

    pub fn security(flags: SecurityFlags) -> Self {
        Self {
            kind: CapabilityKind::Security,
            required: RestrictionValue::Security(flags),
        }
    }

    pub fn reflection(flags: ReflectionFlags) -> Self {
        Self {
            kind: CapabilityKind::Reflection,
            required: RestrictionValue::Reflection(flags),
        }
    }

    pub fn zone(zone: SecurityZone) -> Self {
        Self {
            kind: CapabilityKind::ZoneIdentity,
            required: RestrictionValue::Zone(zone),
        }
    }

    /// Whether `value` satisfies this demand.
    fn satisfied_by(&self, value: &RestrictionValue) -> bool {
        if value.value_kind() != self.required.value_kind() {
            return false;
        }
        match (&self.required, value) {
            (RestrictionValue::State(_), RestrictionValue::State(state)) => {
                *state == GrantState::Granted
            }
            (RestrictionValue::Zone(want), RestrictionValue::Zone(have)) => want == have,
            (required, value) => match (required.flag_bits(), value.flag_bits()) {
                (Some(want), Some(have)) => have & want == want,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.required {
            RestrictionValue::State(_) => write!(f, "{}", self.kind),
            required => write!(f, "{}={}", self.kind, required),
        }
    }
}

/// Capability restrictions applied to an isolated context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionPolicy {
    unrestricted: bool,
    grants: BTreeMap<CapabilityKind, RestrictionValue>,
}

impl RestrictionPolicy {
    /// Create a policy that denies everything.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Create a policy that permits every demand.
    pub fn unrestricted() -> Self {
        Self {
            unrestricted: true,
            grants: BTreeMap::new(),
        }
    }

    /// Set the value for a capability kind.
    ///
    /// Fails if the value's kind does not match the catalog.
    pub fn grant(&mut self, kind: CapabilityKind, value: RestrictionValue) -> SandboxResult<()> {
        let expected = CapabilityCatalog::global().value_kind(kind);
        if value.value_kind() != expected {
            return Err(SandboxError::PolicyMismatch(format!(
                "{} expects a {}, got a {}",
                kind,
                expected,
                value.value_kind()
            )));
        }
        self.grants.insert(kind, value);
        Ok(())
    }

    /// Builder form of [`grant`](Self::grant).
    pub fn with(mut self, kind: CapabilityKind, value: RestrictionValue) -> SandboxResult<Self> {
        self.grant(kind, value)?;
        Ok(self)
    }

    /// Remove the value for a capability kind.
    pub fn revoke(&mut self, kind: CapabilityKind) {
        self.grants.remove(&kind);
    }

    /// Parse and apply a `kind=value` assignment.
    pub fn grant_str(&mut self, assignment: &str) -> SandboxResult<()> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            SandboxError::PolicyMismatch(format!("expected kind=value, got '{}'", assignment))
        })?;
        let kind = CapabilityKind::parse(name.trim())?;
        let value = RestrictionValue::parse(CapabilityCatalog::global().value_kind(kind), value)?;
        self.grant(kind, value)
    }

    /// The configured value for a capability kind.
    pub fn get(&self, kind: CapabilityKind) -> Option<&RestrictionValue> {
        self.grants.get(&kind)
    }

    /// Check a demand against this policy.
    pub fn permits(&self, demand: &Demand) -> bool {
        if self.unrestricted {
            return true;
        }
        self.grants
            .get(&demand.kind)
            .is_some_and(|value| demand.satisfied_by(value))
    }

    pub fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    /// Iterate configured values in catalog-kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&CapabilityKind, &RestrictionValue)> {
        self.grants.iter()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.unrestricted && self.grants.is_empty()
    }

    /// One-line summary, e.g. `file_io=granted, zone_identity=internet`.
    pub fn summary(&self) -> String {
        if self.unrestricted {
            return "unrestricted".to_string();
        }
        if self.grants.is_empty() {
            return "deny-all".to_string();
        }
        self.grants
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Build a policy from a TOML table.
    pub fn from_table(table: &toml::Table) -> SandboxResult<Self> {
        let mut policy = Self::deny_all();
        for (name, raw) in table {
            if name == "unrestricted" {
                policy.unrestricted = raw.as_bool().ok_or_else(|| {
                    SandboxError::PolicyMismatch("'unrestricted' must be a boolean".to_string())
                })?;
                continue;
            }

            let kind = CapabilityKind::parse(name)?;
            let value_kind = CapabilityCatalog::global().value_kind(kind);
            let text = match raw {
                toml::Value::String(s) => s.clone(),
                toml::Value::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            SandboxError::PolicyMismatch(format!(
                                "{}: flag names must be strings",
                                kind
                            ))
                        })
                    })
                    .collect::<SandboxResult<Vec<_>>>()?
                    .join("|"),
                toml::Value::Boolean(true) => "granted".to_string(),
                toml::Value::Boolean(false) => "denied".to_string(),
                other => {
                    return Err(SandboxError::PolicyMismatch(format!(
                        "{}: unsupported value {}",
                        kind, other
                    )))
                }
            };
            policy.grant(kind, RestrictionValue::parse(value_kind, &text)?)?;
        }
        Ok(policy)
    }

    /// Render this policy as a TOML table.
    pub fn to_table(&self) -> toml::Table {
        let mut table = toml::Table::new();
        if self.unrestricted {
            table.insert("unrestricted".to_string(), toml::Value::Boolean(true));
        }
        for (kind, value) in &self.grants {
            table.insert(kind.as_str().to_string(), toml::Value::String(value.to_string()));
        }
        table
    }
}

impl Serialize for RestrictionPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_table().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RestrictionPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let table = toml::Table::deserialize(deserializer)?;
        Self::from_table(&table).map_err(serde::de::Error::custom)
    }
}
