//! Capability kinds and the values used to restrict them.
//!
//! Every restrictable action belongs to a [`CapabilityKind`]. Each kind is
//! parametrized by exactly one [`RestrictionValueKind`]: a tri-state grant, one
//! of the flag sets below, or a [`SecurityZone`].

use crate::error::{SandboxError, SandboxResult};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named category of restrictable action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Runtime security operations (unmanaged code, assertions, threads).
    Security,
    /// Reading and writing files.
    FileIo,
    /// Outbound web requests.
    Web,
    /// Inspecting code and call stacks.
    Reflection,
    /// The per-context registry hive.
    Registry,
    GacIdentity,
    /// Reading environment variables.
    Environment,
    /// Private per-context storage.
    IsolatedStorage,
    /// Cryptographic key containers.
    KeyContainer,
    Principal,
    SiteIdentity,
    PublisherIdentity,
    /// Certificate stores.
    Store,
    StrongNameIdentity,
    TypeDescriptor,
    /// User interface (alerts, windows, clipboard).
    Ui,
    UrlIdentity,
    /// Zone the code is considered to originate from.
    ZoneIdentity,
}

impl CapabilityKind {
    /// Parse a capability kind from its snake_case name.
    pub fn parse(s: &str) -> SandboxResult<Self> {
        let kind = match s {
            "security" => CapabilityKind::Security,
            "file_io" => CapabilityKind::FileIo,
            "web" => CapabilityKind::Web,
            "reflection" => CapabilityKind::Reflection,
            "registry" => CapabilityKind::Registry,
            "gac_identity" => CapabilityKind::GacIdentity,
            "environment" => CapabilityKind::Environment,
            "isolated_storage" => CapabilityKind::IsolatedStorage,
            "key_container" => CapabilityKind::KeyContainer,
            "principal" => CapabilityKind::Principal,
            "site_identity" => CapabilityKind::SiteIdentity,
            "publisher_identity" => CapabilityKind::PublisherIdentity,
            "store" => CapabilityKind::Store,
            "strong_name_identity" => CapabilityKind::StrongNameIdentity,
            "type_descriptor" => CapabilityKind::TypeDescriptor,
            "ui" => CapabilityKind::Ui,
            "url_identity" => CapabilityKind::UrlIdentity,
            "zone_identity" => CapabilityKind::ZoneIdentity,
            other => return Err(SandboxError::UnknownCapability(other.to_string())),
        };
        Ok(kind)
    }

    /// Convert capability kind to its snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Security => "security",
            CapabilityKind::FileIo => "file_io",
            CapabilityKind::Web => "web",
            CapabilityKind::Reflection => "reflection",
            CapabilityKind::Registry => "registry",
            CapabilityKind::GacIdentity => "gac_identity",
            CapabilityKind::Environment => "environment",
            CapabilityKind::IsolatedStorage => "isolated_storage",
            CapabilityKind::KeyContainer => "key_container",
            CapabilityKind::Principal => "principal",
            CapabilityKind::SiteIdentity => "site_identity",
            CapabilityKind::PublisherIdentity => "publisher_identity",
            CapabilityKind::Store => "store",
            CapabilityKind::StrongNameIdentity => "strong_name_identity",
            CapabilityKind::TypeDescriptor => "type_descriptor",
            CapabilityKind::Ui => "ui",
            CapabilityKind::UrlIdentity => "url_identity",
            CapabilityKind::ZoneIdentity => "zone_identity",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shape of value a capability kind is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionValueKind {
    GrantState,
    SecurityFlags,
    ReflectionFlags,
    KeyContainerFlags,
    StoreFlags,
    TypeDescriptorFlags,
    SecurityZone,
}

impl RestrictionValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestrictionValueKind::GrantState => "grant_state",
            RestrictionValueKind::SecurityFlags => "security_flags",
            RestrictionValueKind::ReflectionFlags => "reflection_flags",
            RestrictionValueKind::KeyContainerFlags => "key_container_flags",
            RestrictionValueKind::StoreFlags => "store_flags",
            RestrictionValueKind::TypeDescriptorFlags => "type_descriptor_flags",
            RestrictionValueKind::SecurityZone => "security_zone",
        }
    }

    /// Names accepted when configuring a value of this kind.
    pub fn accepted_names(&self) -> Vec<String> {
        fn flag_names<F: bitflags::Flags>() -> Vec<String> {
            F::FLAGS
                .iter()
                .map(|flag| flag.name().to_ascii_lowercase())
                .collect()
        }

        match self {
            RestrictionValueKind::GrantState => vec![
                "granted".to_string(),
                "denied".to_string(),
                "none".to_string(),
            ],
            RestrictionValueKind::SecurityFlags => flag_names::<SecurityFlags>(),
            RestrictionValueKind::ReflectionFlags => flag_names::<ReflectionFlags>(),
            RestrictionValueKind::KeyContainerFlags => flag_names::<KeyContainerFlags>(),
            RestrictionValueKind::StoreFlags => flag_names::<StoreFlags>(),
            RestrictionValueKind::TypeDescriptorFlags => flag_names::<TypeDescriptorFlags>(),
            RestrictionValueKind::SecurityZone => SecurityZone::ALL
                .iter()
                .map(|z| z.as_str().to_string())
                .collect(),
        }
    }
}

impl fmt::Display for RestrictionValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state grant indicator. `None` means "not configured" and denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    Granted,
    Denied,
    #[default]
    None,
}

bitflags! {
    /// Runtime security operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SecurityFlags: u32 {
        const ASSERTION = 1 << 0;
        const UNMANAGED_CODE = 1 << 1;
        const SKIP_VERIFICATION = 1 << 2;
        const EXECUTION = 1 << 3;
        const CONTROL_THREAD = 1 << 4;
        const CONTROL_EVIDENCE = 1 << 5;
        const CONTROL_POLICY = 1 << 6;
        const SERIALIZATION_FORMATTER = 1 << 7;
        const CONTROL_DOMAIN_POLICY = 1 << 8;
        const CONTROL_PRINCIPAL = 1 << 9;
        const CONTROL_APP_DOMAIN = 1 << 10;
        const REMOTING_CONFIGURATION = 1 << 11;
        const INFRASTRUCTURE = 1 << 12;
        const BINDING_REDIRECTS = 1 << 13;
    }

    /// Reflection operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReflectionFlags: u32 {
        const TYPE_INFORMATION = 1 << 0;
        const MEMBER_ACCESS = 1 << 1;
        const REFLECTION_EMIT = 1 << 2;
        const RESTRICTED_MEMBER_ACCESS = 1 << 3;
    }

    /// Key container operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyContainerFlags: u32 {
        const CREATE = 1 << 0;
        const OPEN = 1 << 1;
        const DELETE = 1 << 2;
        const IMPORT = 1 << 3;
        const EXPORT = 1 << 4;
        const SIGN = 1 << 5;
        const DECRYPT = 1 << 6;
        const VIEW_ACL = 1 << 7;
        const CHANGE_ACL = 1 << 8;
    }

    /// Certificate store operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StoreFlags: u32 {
        const CREATE_STORE = 1 << 0;
        const DELETE_STORE = 1 << 1;
        const ENUMERATE_STORES = 1 << 2;
        const OPEN_STORE = 1 << 3;
        const ADD_TO_STORE = 1 << 4;
        const REMOVE_FROM_STORE = 1 << 5;
        const ENUMERATE_CERTIFICATES = 1 << 6;
    }

    /// Type descriptor operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeDescriptorFlags: u32 {
        const RESTRICTED_REGISTRATION_ACCESS = 1 << 0;
    }
}

/// Zone a piece of code is considered to originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityZone {
    MyComputer,
    Intranet,
    Trusted,
    Internet,
    Untrusted,
    NoZone,
}

impl SecurityZone {
    pub const ALL: [SecurityZone; 6] = [
        SecurityZone::MyComputer,
        SecurityZone::Intranet,
        SecurityZone::Trusted,
        SecurityZone::Internet,
        SecurityZone::Untrusted,
        SecurityZone::NoZone,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|z| z.as_str() == s)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityZone::MyComputer => "my_computer",
            SecurityZone::Intranet => "intranet",
            SecurityZone::Trusted => "trusted",
            SecurityZone::Internet => "internet",
            SecurityZone::Untrusted => "untrusted",
            SecurityZone::NoZone => "no_zone",
        }
    }
}

impl fmt::Display for SecurityZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete value configuring one capability kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionValue {
    State(GrantState),
    Security(SecurityFlags),
    Reflection(ReflectionFlags),
    KeyContainer(KeyContainerFlags),
    Store(StoreFlags),
    TypeDescriptor(TypeDescriptorFlags),
    Zone(SecurityZone),
}

impl RestrictionValue {
    /// The kind of this value.
    pub fn value_kind(&self) -> RestrictionValueKind {
        match self {
            RestrictionValue::State(_) => RestrictionValueKind::GrantState,
            RestrictionValue::Security(_) => RestrictionValueKind::SecurityFlags,
            RestrictionValue::Reflection(_) => RestrictionValueKind::ReflectionFlags,
            RestrictionValue::KeyContainer(_) => RestrictionValueKind::KeyContainerFlags,
            RestrictionValue::Store(_) => RestrictionValueKind::StoreFlags,
            RestrictionValue::TypeDescriptor(_) => RestrictionValueKind::TypeDescriptorFlags,
            RestrictionValue::Zone(_) => RestrictionValueKind::SecurityZone,
        }
    }

    /// Raw flag bits, for flag-set values.
    pub fn flag_bits(&self) -> Option<u32> {
        match self {
            RestrictionValue::Security(f) => Some(f.bits()),
            RestrictionValue::Reflection(f) => Some(f.bits()),
            RestrictionValue::KeyContainer(f) => Some(f.bits()),
            RestrictionValue::Store(f) => Some(f.bits()),
            RestrictionValue::TypeDescriptor(f) => Some(f.bits()),
            RestrictionValue::State(_) | RestrictionValue::Zone(_) => None,
        }
    }

    /// The most permissive value of the given kind.
    ///
    /// Zones have no ordering, so the unrestricted zone is `MyComputer`.
    pub fn unrestricted(kind: RestrictionValueKind) -> Self {
        match kind {
            RestrictionValueKind::GrantState => RestrictionValue::State(GrantState::Granted),
            RestrictionValueKind::SecurityFlags => RestrictionValue::Security(SecurityFlags::all()),
            RestrictionValueKind::ReflectionFlags => {
                RestrictionValue::Reflection(ReflectionFlags::all())
            }
            RestrictionValueKind::KeyContainerFlags => {
                RestrictionValue::KeyContainer(KeyContainerFlags::all())
            }
            RestrictionValueKind::StoreFlags => RestrictionValue::Store(StoreFlags::all()),
            RestrictionValueKind::TypeDescriptorFlags => {
                RestrictionValue::TypeDescriptor(TypeDescriptorFlags::all())
            }
            RestrictionValueKind::SecurityZone => RestrictionValue::Zone(SecurityZone::MyComputer),
        }
    }

    /// Parse a value of the given kind.
    ///
    /// Grant states and zones are single names. Flag sets are names
    /// separated by `|` or `,`; `all` and `none` are accepted too.
    pub fn parse(kind: RestrictionValueKind, s: &str) -> SandboxResult<Self> {
        let s = s.trim();
        let value = match kind {
            RestrictionValueKind::GrantState => RestrictionValue::State(match s {
                "granted" | "unrestricted" => GrantState::Granted,
                "denied" => GrantState::Denied,
                "none" | "" => GrantState::None,
                other => return Err(mismatch(kind, other)),
            }),
            RestrictionValueKind::SecurityZone => RestrictionValue::Zone(
                SecurityZone::parse(s).ok_or_else(|| mismatch(kind, s))?,
            ),
            RestrictionValueKind::SecurityFlags => {
                RestrictionValue::Security(parse_flags::<SecurityFlags>(kind, s)?)
            }
            RestrictionValueKind::ReflectionFlags => {
                RestrictionValue::Reflection(parse_flags::<ReflectionFlags>(kind, s)?)
            }
            RestrictionValueKind::KeyContainerFlags => {
                RestrictionValue::KeyContainer(parse_flags::<KeyContainerFlags>(kind, s)?)
            }
            RestrictionValueKind::StoreFlags => {
                RestrictionValue::Store(parse_flags::<StoreFlags>(kind, s)?)
            }
            RestrictionValueKind::TypeDescriptorFlags => {
                RestrictionValue::TypeDescriptor(parse_flags::<TypeDescriptorFlags>(kind, s)?)
            }
        };
        Ok(value)
    }
}

impl fmt::Display for RestrictionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_flags<F: bitflags::Flags>(f: &mut fmt::Formatter<'_>, flags: &F) -> fmt::Result {
            let names: Vec<String> = flags
                .iter_names()
                .map(|(name, _)| name.to_ascii_lowercase())
                .collect();
            if names.is_empty() {
                f.write_str("none")
            } else {
                f.write_str(&names.join("|"))
            }
        }

        match self {
            RestrictionValue::State(GrantState::Granted) => f.write_str("granted"),
            RestrictionValue::State(GrantState::Denied) => f.write_str("denied"),
            RestrictionValue::State(GrantState::None) => f.write_str("none"),
            RestrictionValue::Security(v) => write_flags(f, v),
            RestrictionValue::Reflection(v) => write_flags(f, v),
            RestrictionValue::KeyContainer(v) => write_flags(f, v),
            RestrictionValue::Store(v) => write_flags(f, v),
            RestrictionValue::TypeDescriptor(v) => write_flags(f, v),
            RestrictionValue::Zone(z) => fmt::Display::fmt(z, f),
        }
    }
}

fn mismatch(kind: RestrictionValueKind, got: &str) -> SandboxError {
    SandboxError::PolicyMismatch(format!(
        "'{}' is not a valid {} (expected one of: {})",
        got,
        kind,
        kind.accepted_names().join(", ")
    ))
}

fn parse_flags<F: bitflags::Flags>(kind: RestrictionValueKind, s: &str) -> SandboxResult<F> {
    let mut flags = F::empty();
    for part in s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
        match part {
            "all" => flags = F::all(),
            "none" => {}
            name => {
                let flag =
                    F::from_name(&name.to_ascii_uppercase()).ok_or_else(|| mismatch(kind, name))?;
                flags.insert(flag);
            }
        }
    }
    Ok(flags)
}
