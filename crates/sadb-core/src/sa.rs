//! Security Association records and their identifiers.
//!
//! An SA is addressed by `(frame_type, spi, scid)`: the frame type selects the
//! partition the record lives in, and `(spi, scid)` is unique within that
//! partition. The channel tuple ([`Gvcid`]) is not a key; several SAs may share
//! one (successive key epochs), but at most one of them may be operational.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Composite primary key of an SA within one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SaId {
    /// Security Parameter Index, scoped per spacecraft.
    pub spi: u16,
    /// Spacecraft identifier.
    pub scid: u16,
}

impl SaId {
    /// Create an identifier from its parts.
    pub const fn new(spi: u16, scid: u16) -> Self {
        Self { spi, scid }
    }
}

impl fmt::Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.spi, self.scid)
    }
}

/// Global virtual channel identifier: the logical channel an SA protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvcid {
    /// Spacecraft identifier.
    pub scid: u16,
    /// Transfer frame version number.
    pub tfvn: u8,
    /// Virtual channel identifier.
    pub vcid: u8,
    /// Multiplexer access point identifier.
    pub mapid: u8,
}

impl fmt::Display for Gvcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(scid {}, tfvn {}, vcid {}, mapid {})",
            self.scid, self.tfvn, self.vcid, self.mapid
        )
    }
}

/// Field ranges permitted for one frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    /// Largest spacecraft identifier.
    pub max_scid: u16,
    /// Largest transfer frame version number.
    pub max_tfvn: u8,
    /// Largest virtual channel identifier.
    pub max_vcid: u8,
    /// Largest multiplexer access point identifier.
    pub max_mapid: u8,
}

/// Space link frame family. Each variant is a separate storage partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum FrameType {
    /// Telecommand.
    #[default]
    Tc,
    /// Telemetry.
    Tm,
    /// Advanced Orbiting Systems.
    Aos,
}

impl FrameType {
    /// Every frame type, in partition order.
    pub const ALL: [Self; 3] = [Self::Tc, Self::Tm, Self::Aos];

    /// Name of the partition (table) holding this frame type's SAs.
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Tc => "SecAssn",
            Self::Tm => "SecAssnTm",
            Self::Aos => "SecAssnAos",
        }
    }

    /// Field limits for channels of this frame type.
    pub const fn limits(self) -> ChannelLimits {
        match self {
            Self::Tc => ChannelLimits { max_scid: 0x3FF, max_tfvn: 3, max_vcid: 0x3F, max_mapid: 0x3F },
            Self::Tm => ChannelLimits { max_scid: 0x3FF, max_tfvn: 3, max_vcid: 0x07, max_mapid: 0x3F },
            Self::Aos => ChannelLimits { max_scid: 0xFF, max_tfvn: 3, max_vcid: 0x3F, max_mapid: 0x3F },
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tc => "TC",
            Self::Tm => "TM",
            Self::Aos => "AOS",
        })
    }
}

/// Lifecycle state of an SA. Deletion is not a state; a deleted SA is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaState {
    /// Created, no key material bound.
    Unkeyed,
    /// Key material bound, not protecting traffic.
    Keyed,
    /// The SA currently protecting its channel.
    Operational,
    /// Retired; key references cleared.
    Expired,
}

impl fmt::Display for SaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unkeyed => "UNKEYED",
            Self::Keyed => "KEYED",
            Self::Operational => "OPERATIONAL",
            Self::Expired => "EXPIRED",
        })
    }
}

/// One side (encryption or authentication) of a key assignment.
///
/// The key reference is opaque: it names key material held by an external key
/// store and is never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBinding {
    /// Reference to externally held key material.
    pub key_ref: String,
    /// Cipher suite identifier.
    pub cipher_suite: Vec<u8>,
    /// Cipher suite length in bits.
    pub cipher_suite_len: u16,
}

impl KeyBinding {
    /// Create a binding.
    pub fn new(key_ref: impl Into<String>, cipher_suite: Vec<u8>, cipher_suite_len: u16) -> Self {
        Self { key_ref: key_ref.into(), cipher_suite, cipher_suite_len }
    }
}

/// A stored Security Association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssociation {
    /// Partition the record lives in.
    pub frame_type: FrameType,
    /// Primary key. Never changes after creation.
    pub id: SaId,
    /// Transfer frame version number.
    pub tfvn: u8,
    /// Virtual channel identifier.
    pub vcid: u8,
    /// Multiplexer access point identifier.
    pub mapid: u8,
    /// Lifecycle state.
    pub state: SaState,
    /// Encryption key reference.
    pub ekid: Option<String>,
    /// Encryption cipher suite.
    pub ecs: Option<Vec<u8>>,
    /// Encryption cipher suite length.
    pub ecs_len: Option<u16>,
    /// Authentication key reference.
    pub akid: Option<String>,
    /// Authentication cipher suite.
    pub acs: Option<Vec<u8>>,
    /// Authentication cipher suite length.
    pub acs_len: Option<u16>,
}

impl SecurityAssociation {
    /// A fresh, unkeyed SA on the given channel.
    pub fn unkeyed(frame_type: FrameType, id: SaId, tfvn: u8, vcid: u8, mapid: u8) -> Self {
        Self {
            frame_type,
            id,
            tfvn,
            vcid,
            mapid,
            state: SaState::Unkeyed,
            ekid: None,
            ecs: None,
            ecs_len: None,
            akid: None,
            acs: None,
            acs_len: None,
        }
    }

    /// The channel tuple this SA protects.
    pub fn gvcid(&self) -> Gvcid {
        Gvcid { scid: self.id.scid, tfvn: self.tfvn, vcid: self.vcid, mapid: self.mapid }
    }

    /// Whether this SA is protecting live traffic.
    pub fn is_operational(&self) -> bool {
        self.state == SaState::Operational
    }

    /// Bind encryption key material.
    pub fn bind_encryption(&mut self, binding: KeyBinding) {
        self.ekid = Some(binding.key_ref);
        self.ecs = Some(binding.cipher_suite);
        self.ecs_len = Some(binding.cipher_suite_len);
    }

    /// Bind authentication key material.
    pub fn bind_authentication(&mut self, binding: KeyBinding) {
        self.akid = Some(binding.key_ref);
        self.acs = Some(binding.cipher_suite);
        self.acs_len = Some(binding.cipher_suite_len);
    }

    /// Structural validation of a complete record.
    ///
    /// Key references may only be present while the SA is keyed or
    /// operational.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_spi(self.id.spi)?;
        validate_channel(self.frame_type, self.gvcid())?;

        let has_keys = self.ekid.is_some() || self.akid.is_some();
        if has_keys && matches!(self.state, SaState::Unkeyed | SaState::Expired) {
            return Err(ValidationError::KeysInState { id: self.id, state: self.state });
        }
        Ok(())
    }
}

/// Request to create an SA.
///
/// Channel fields are optional so that partially filled requests coming from
/// an administrative surface are rejected with a precise
/// [`ValidationError::MissingField`] rather than defaulted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSecurityAssociation {
    /// Target partition.
    pub frame_type: FrameType,
    /// Requested SPI; allocated from the current maximum when absent.
    pub spi: Option<u16>,
    /// Spacecraft identifier.
    pub scid: Option<u16>,
    /// Transfer frame version number.
    pub tfvn: Option<u8>,
    /// Virtual channel identifier.
    pub vcid: Option<u8>,
    /// Multiplexer access point identifier.
    pub mapid: Option<u8>,
    /// Initial encryption key material.
    pub encryption: Option<KeyBinding>,
    /// Initial authentication key material.
    pub authentication: Option<KeyBinding>,
}

impl NewSecurityAssociation {
    /// Request an SA on `gvcid` with an allocated SPI.
    pub fn on_channel(frame_type: FrameType, gvcid: Gvcid) -> Self {
        Self {
            frame_type,
            spi: None,
            scid: Some(gvcid.scid),
            tfvn: Some(gvcid.tfvn),
            vcid: Some(gvcid.vcid),
            mapid: Some(gvcid.mapid),
            encryption: None,
            authentication: None,
        }
    }

    /// Request a specific SPI instead of an allocated one.
    #[must_use]
    pub fn with_spi(mut self, spi: u16) -> Self {
        self.spi = Some(spi);
        self
    }

    /// Attach initial encryption key material.
    #[must_use]
    pub fn with_encryption(mut self, binding: KeyBinding) -> Self {
        self.encryption = Some(binding);
        self
    }

    /// Attach initial authentication key material.
    #[must_use]
    pub fn with_authentication(mut self, binding: KeyBinding) -> Self {
        self.authentication = Some(binding);
        self
    }

    /// Check the request and return its channel tuple.
    pub fn validate(&self) -> Result<Gvcid, ValidationError> {
        let gvcid = Gvcid {
            scid: self.scid.ok_or(ValidationError::MissingField { field: "scid" })?,
            tfvn: self.tfvn.ok_or(ValidationError::MissingField { field: "tfvn" })?,
            vcid: self.vcid.ok_or(ValidationError::MissingField { field: "vcid" })?,
            mapid: self.mapid.ok_or(ValidationError::MissingField { field: "mapid" })?,
        };
        if let Some(spi) = self.spi {
            validate_spi(spi)?;
        }
        validate_channel(self.frame_type, gvcid)?;
        Ok(gvcid)
    }

    /// Build the record to insert once an SPI has been settled.
    ///
    /// The request must have passed [`Self::validate`].
    pub fn into_record(self, gvcid: Gvcid, spi: u16) -> SecurityAssociation {
        let mut sa = SecurityAssociation::unkeyed(
            self.frame_type,
            SaId::new(spi, gvcid.scid),
            gvcid.tfvn,
            gvcid.vcid,
            gvcid.mapid,
        );
        let keyed = self.encryption.is_some() || self.authentication.is_some();
        if let Some(binding) = self.encryption {
            sa.bind_encryption(binding);
        }
        if let Some(binding) = self.authentication {
            sa.bind_authentication(binding);
        }
        if keyed {
            sa.state = SaState::Keyed;
        }
        sa
    }
}

fn validate_spi(spi: u16) -> Result<(), ValidationError> {
    if spi == 0 {
        return Err(ValidationError::ReservedSpi);
    }
    Ok(())
}

fn validate_channel(frame_type: FrameType, gvcid: Gvcid) -> Result<(), ValidationError> {
    let limits = frame_type.limits();
    let checks = [
        ("scid", u32::from(gvcid.scid), u32::from(limits.max_scid)),
        ("tfvn", u32::from(gvcid.tfvn), u32::from(limits.max_tfvn)),
        ("vcid", u32::from(gvcid.vcid), u32::from(limits.max_vcid)),
        ("mapid", u32::from(gvcid.mapid), u32::from(limits.max_mapid)),
    ];
    for (field, value, max) in checks {
        if value > max {
            return Err(ValidationError::OutOfRange { field, value, max, frame_type });
        }
    }
    Ok(())
}
