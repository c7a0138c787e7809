#![deny(clippy::unwrap_used)]

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub mod mapping;
pub mod overrides;
pub mod transaction;

pub const DEFAULT_LIMIT: usize = 6;

/// Why a paired SKU was refused by availability validation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[display("not found")]
    NotFound,
    #[display("unpublished")]
    Unpublished,
    #[display("out of stock")]
    OutOfStock,
}

pub fn normalize_sku<S: AsRef<str>>(sku: S) -> String {
    sku.as_ref().trim().to_string()
}

pub fn parse_publish_flag<S: AsRef<str>>(flag: S) -> bool {
    flag.as_ref().trim() == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_flag_is_compared_as_trimmed_string() {
        assert!(parse_publish_flag("1"));
        assert!(parse_publish_flag(" 1 "));
        assert!(!parse_publish_flag("0"));
        assert!(!parse_publish_flag("1.0"));
        assert!(!parse_publish_flag("true"));
        assert!(!parse_publish_flag(""));
    }

    #[test]
    fn rejection_reasons_are_human_readable() {
        assert_eq!(Rejection::NotFound.to_string(), "not found");
        assert_eq!(Rejection::Unpublished.to_string(), "unpublished");
        assert_eq!(Rejection::OutOfStock.to_string(), "out of stock");
    }
}
