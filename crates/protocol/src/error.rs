//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// String descriptor header is malformed
    #[error("Invalid string descriptor: type {descriptor_type:#04x}, length {length}")]
    InvalidDescriptor { descriptor_type: u8, length: u8 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BufferTooSmall {
            needed: 8,
            available: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Buffer too small"));
        assert!(msg.contains("needed 8"));
    }

    #[test]
    fn test_invalid_descriptor_display() {
        let err = ProtocolError::InvalidDescriptor {
            descriptor_type: 0x02,
            length: 9,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0x02"));
    }
}
