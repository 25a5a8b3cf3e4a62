//! Access mode × access type compatibility
//!
//! | Access Type | SINGLE_NODE_* | MULTI_NODE_READER_ONLY | MULTI_NODE_SINGLE_WRITER | MULTI_NODE_MULTI_WRITER |
//! |-------------|---------------|------------------------|--------------------------|-------------------------|
//! | Block       | allowed       | allowed (multi-map)    | rejected                 | allowed (multi-map)     |
//! | Mount       | allowed       | allowed (multi-map)    | rejected                 | rejected                |

use crate::domain::csi::{AccessMode, VolumeCapability};

/// Result of checking one capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    /// Supported; multi-node modes need the array to allow several mappings
    Allowed { allow_multiple_mappings: bool },
    /// Unsupported, with a human-readable reason
    Rejected(String),
}

/// Check a single capability against the support table
pub fn check_capability(cap: &VolumeCapability) -> AccessCheck {
    let Some(mode) = cap.access_mode else {
        return AccessCheck::Rejected("access mode is required".into());
    };
    let Some(access_type) = cap.access_type.as_ref() else {
        return AccessCheck::Rejected("access type is required".into());
    };
    let block = access_type.is_block();

    match mode {
        AccessMode::Unknown => AccessCheck::Rejected("access mode unknown".into()),
        m if m.is_single_node() => AccessCheck::Allowed {
            allow_multiple_mappings: false,
        },
        AccessMode::MultiNodeReaderOnly => AccessCheck::Allowed {
            allow_multiple_mappings: true,
        },
        AccessMode::MultiNodeMultiWriter if block => AccessCheck::Allowed {
            allow_multiple_mappings: true,
        },
        AccessMode::MultiNodeMultiWriter => AccessCheck::Rejected(
            "multi-node with writer(s) only supported for block access type".into(),
        ),
        AccessMode::MultiNodeSingleWriter => {
            AccessCheck::Rejected("multi-node single writer is not supported".into())
        }
        // Every single-node mode is handled by the guard above
        _ => AccessCheck::Rejected(format!("access mode {} is not supported", mode)),
    }
}

/// Check every capability; `Err` carries the first rejection reason
pub fn validate_capabilities(caps: &[VolumeCapability]) -> Result<(), String> {
    for cap in caps {
        if let AccessCheck::Rejected(reason) = check_capability(cap) {
            return Err(reason);
        }
    }
    Ok(())
}
