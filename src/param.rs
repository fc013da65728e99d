use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::TypeList;
use crate::{Result, UploadError, FOREVER_TYPE};

/// One expected binary payload, as declared by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ParameterDescriptor {
    pub fn new(size: u64, type_tag: &str) -> Self {
        Self {
            size,
            type_tag: type_tag.to_owned(),
            name: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Name used in progress messages and for the loaded model.
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) if !name.is_empty() => name,
            _ => &self.type_tag,
        }
    }
}

/// A fully received payload. Moved, never copied, from the assembler to
/// the loader.
#[derive(Debug, PartialEq, Eq)]
pub struct Blob {
    pub type_tag: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Case-insensitive match of a declared type against supported ones:
/// exact first, then "declared type is a suffix of a supported type".
pub fn matches_type<'a, I>(declared: &str, supported: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let declared = declared.to_lowercase();
    if declared.is_empty() {
        return false;
    }
    let supported: Vec<String> =
        supported.into_iter().map(|t| t.to_lowercase()).collect();
    supported.iter().any(|t| *t == declared)
        || supported.iter().any(|t| t.ends_with(&declared))
}

/// Validate a batch before any byte is accepted and return the total
/// number of declared bytes.
///
/// Descriptors are checked in order and the first offending one decides
/// the error.
pub fn validate(
    params: &[ParameterDescriptor],
    supported_types: &BTreeSet<String>,
    max_declared_bytes: Option<u64>,
) -> Result<u64> {
    if params.is_empty() {
        return Err(UploadError::MissingParams);
    }

    let mut total: u64 = 0;
    for (index, param) in params.iter().enumerate() {
        if param.type_tag.is_empty() || param.size == 0 {
            return Err(UploadError::MissingParams);
        }
        if let Some(max) = max_declared_bytes {
            if param.size > max {
                log::warn!(
                    "param {} declares {} bytes, limit is {}",
                    index,
                    param.size,
                    max
                );
                return Err(UploadError::MissingParams);
            }
        }

        if param.type_tag != FOREVER_TYPE
            && !matches_type(&param.type_tag, supported_types)
        {
            let supported_types: Vec<String> =
                supported_types.iter().cloned().collect();
            log::warn!(
                "param {} has unsupported type '{}', supported: {}",
                index,
                param.type_tag,
                TypeList(&supported_types)
            );
            return Err(UploadError::UnsupportedType {
                index,
                supported_types,
            });
        }
        total = total.saturating_add(param.size);
    }
    Ok(total)
}
