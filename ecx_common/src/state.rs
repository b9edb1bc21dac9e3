//! EtherCAT application-layer state values.

use core::fmt;

/// Bit set in a raw AL status word when the slave reports an error
/// alongside its state.
pub const AL_ERROR_FLAG: u8 = 0x10;

/// EtherCAT application-layer state machine values.
///
/// The numeric values are fixed by the protocol and stored raw (`u8`) in the
/// shared bus directory; use [`AlState::from_u8`] when interpreting a field
/// another process may have written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlState {
    /// No mailbox or process-data communication.
    Init = 0x01,
    /// Mailbox (SDO) communication available.
    PreOp = 0x02,
    /// Firmware-download state.
    Boot = 0x03,
    /// Inputs valid, outputs ignored.
    SafeOp = 0x04,
    /// Full cyclic exchange.
    Op = 0x08,
}

impl AlState {
    /// Convert from a raw status value. The error flag (0x10) is masked off;
    /// returns `None` for values outside the protocol's state set.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value & !AL_ERROR_FLAG {
            0x01 => Some(Self::Init),
            0x02 => Some(Self::PreOp),
            0x03 => Some(Self::Boot),
            0x04 => Some(Self::SafeOp),
            0x08 => Some(Self::Op),
            _ => None,
        }
    }

    /// Raw protocol value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::PreOp => "PRE-OP",
            Self::Boot => "BOOT",
            Self::SafeOp => "SAFE-OP",
            Self::Op => "OP",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_maps_protocol_values() {
        assert_eq!(AlState::from_u8(0x01), Some(AlState::Init));
        assert_eq!(AlState::from_u8(0x02), Some(AlState::PreOp));
        assert_eq!(AlState::from_u8(0x03), Some(AlState::Boot));
        assert_eq!(AlState::from_u8(0x04), Some(AlState::SafeOp));
        assert_eq!(AlState::from_u8(0x08), Some(AlState::Op));
    }

    #[test]
    fn from_u8_masks_error_flag() {
        // 0x18 = OP + error flag, as reported by a faulted slave.
        assert_eq!(AlState::from_u8(0x18), Some(AlState::Op));
        assert_eq!(AlState::from_u8(0x11), Some(AlState::Init));
    }

    #[test]
    fn from_u8_rejects_unknown() {
        assert_eq!(AlState::from_u8(0x00), None);
        assert_eq!(AlState::from_u8(0x05), None);
        assert_eq!(AlState::from_u8(0xFF), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(AlState::SafeOp.to_string(), "SAFE-OP");
        assert_eq!(AlState::Op.to_string(), "OP");
    }
}
