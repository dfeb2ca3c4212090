//! Receipt decoration: size, content tag and last-modified.
//!
//! A receipt type opts in to each capability through the associated consts
//! on [`Receipt`]. When a capability is off, the matching decoration path
//! compiles away; in particular no hashing work happens for a tag-less
//! receipt even when a hasher factory is configured on the server.
//!
//! Decoration fills only zero-valued fields, so values set by the handler
//! always win.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Per-request receipt sent as the body of the terminal frame.
///
/// The framework constructs default receipts in two situations (the value
/// offered through `Call::receipt` and the one synthesized when a handler
/// never calls `close`), hence the `Default` bound.
pub trait Receipt: Default + Send + 'static {
    /// Whether this type carries a content tag.
    const HAS_TAG: bool = false;
    /// Whether this type carries a body-size sum.
    const HAS_SIZE: bool = false;
    /// Whether this type carries a last-modified timestamp.
    const HAS_LAST_MODIFIED: bool = false;

    /// Content tag (hex-encoded hash over message bodies). Empty = unset.
    fn get_tag(&self) -> &str {
        ""
    }
    /// Set the content tag.
    fn set_tag(&mut self, _tag: String) {}

    /// Sum of message body lengths. Zero = unset.
    fn get_size(&self) -> u32 {
        0
    }
    /// Set the size.
    fn set_size(&mut self, _size: u32) {}

    /// Unix seconds at finalize time. Zero = unset.
    fn get_last_modified(&self) -> i64 {
        0
    }
    /// Set the last-modified timestamp.
    fn set_last_modified(&mut self, _secs: i64) {}
}

/// Ready-made identity block implementing all three capabilities.
///
/// Embed it in a receipt type with `#[serde(flatten)]` and delegate the
/// trait methods to it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Identity {
    /// Last modified time in Unix seconds.
    pub last_modified: i64,
    /// Hex-encoded checksum over the message bodies.
    pub e_tag: String,
    /// Sum of the message body lengths.
    pub size: u32,
}

impl Receipt for Identity {
    const HAS_TAG: bool = true;
    const HAS_SIZE: bool = true;
    const HAS_LAST_MODIFIED: bool = true;

    fn get_tag(&self) -> &str {
        &self.e_tag
    }
    fn set_tag(&mut self, tag: String) {
        self.e_tag = tag;
    }
    fn get_size(&self) -> u32 {
        self.size
    }
    fn set_size(&mut self, size: u32) {
        self.size = size;
    }
    fn get_last_modified(&self) -> i64 {
        self.last_modified
    }
    fn set_last_modified(&mut self, secs: i64) {
        self.last_modified = secs;
    }
}

/// Rolling hash over message bodies, fed in enqueue order.
pub trait MessageHasher: Send {
    /// Absorb one encoded message body.
    fn update(&mut self, body: &[u8]);
    /// Current digest bytes.
    fn digest(&self) -> Vec<u8>;
}

/// Factory producing one hasher per request. `None` on the server options
/// disables hashing entirely.
pub type HasherFactory = std::sync::Arc<dyn Fn() -> Box<dyn MessageHasher> + Send + Sync>;

/// FNV-1a 64-bit, the stock hasher.
#[derive(Default)]
pub struct Fnv1a64(fnv::FnvHasher);

impl Fnv1a64 {
    /// Create a hasher at the FNV-1a offset basis.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageHasher for Fnv1a64 {
    fn update(&mut self, body: &[u8]) {
        use std::hash::Hasher;
        self.0.write(body);
    }

    fn digest(&self) -> Vec<u8> {
        use std::hash::Hasher;
        self.0.finish().to_be_bytes().to_vec()
    }
}

/// Fill zero-valued receipt fields from the accumulated request state.
///
/// `tag` is `None` when hashing was off for this request.
pub(crate) fn decorate<R: Receipt>(receipt: &mut R, size: u32, tag: Option<&str>) {
    if R::HAS_LAST_MODIFIED && receipt.get_last_modified() == 0 {
        receipt.set_last_modified(unix_now());
    }
    if R::HAS_SIZE && size != 0 && receipt.get_size() == 0 {
        receipt.set_size(size);
    }
    if R::HAS_TAG {
        if let Some(tag) = tag {
            if receipt.get_tag().is_empty() {
                receipt.set_tag(tag.to_string());
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
