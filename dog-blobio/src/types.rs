use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::{BlobIoError, BlobIoResult};

/// Direction a handle is opened in. Fixed for the life of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "rb",
            Self::Write => "wb",
        }
    }
}

impl FromStr for OpenMode {
    type Err = BlobIoError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "rb" | "read" => Ok(Self::Read),
            "wb" | "write" => Ok(Self::Write),
            other => Err(BlobIoError::invalid(format!("Unsupported mode: {}", other))),
        }
    }
}

impl std::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference point for [`crate::BlobIo::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl TryFrom<i32> for Whence {
    type Error = BlobIoError;

    /// Accepts the conventional `SEEK_SET`/`SEEK_CUR`/`SEEK_END` codes
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            other => Err(BlobIoError::invalid(format!("Unsupported whence: {}", other))),
        }
    }
}

/// Identifier produced by a successful stage operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    /// Generate a new random block id (base64 of a v4 UUID, so every id in
    /// a blob has the same encoded length)
    pub fn generate() -> Self {
        Self(STANDARD.encode(Uuid::new_v4().as_bytes()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BlockId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Query parameters that carry a pre-authorized request signature
const SIGNATURE_PARAMS: &[&str] = &["sig", "x-amz-signature"];

/// Location of a single blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAddress {
    url: Url,
}

impl BlobAddress {
    pub fn parse(address: &str) -> BlobIoResult<Self> {
        let url = Url::parse(address)
            .map_err(|e| BlobIoError::invalid(format!("Invalid blob address {}: {}", address, e)))?;
        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Address without query or fragment, suitable as a storage key
    pub fn without_query(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.to_string()
    }

    /// True when the address embeds its own signed access token
    pub fn has_presigned_signature(&self) -> bool {
        self.url
            .query_pairs()
            .any(|(key, _)| SIGNATURE_PARAMS.iter().any(|p| key.eq_ignore_ascii_case(p)))
    }
}

impl std::fmt::Display for BlobAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}
