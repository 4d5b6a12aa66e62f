use std::{mem, ptr, slice};

use aya::Pod;

use crate::attach::XdpMode;
use crate::error::{AttachFailure, TableAccessError};

/// Declared key and value widths of a table, in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableLayout {
    pub key_size: usize,
    pub value_size: usize,
}

/// What the control plane needs from a loaded eBPF object: named tables with
/// fixed widths and named XDP programs that can be attached by ifindex.
///
/// Every table call goes to the backing store; implementations keep no copy
/// of table contents.
pub trait Collection {
    type Link: Detach;

    /// Layout of `name`, or `None` when the object declares no such table.
    fn table_layout(&self, name: &str) -> Result<Option<TableLayout>, TableAccessError>;

    /// Value stored at `key`, or `None` when the key is absent.
    fn lookup<K: Pod, V: Pod>(&self, table: &str, key: &K) -> Result<Option<V>, TableAccessError>;

    fn update<K: Pod, V: Pod>(
        &mut self,
        table: &str,
        key: &K,
        value: &V,
    ) -> Result<(), TableAccessError>;

    fn attach_xdp(
        &mut self,
        program: &str,
        ifindex: u32,
        mode: XdpMode,
    ) -> Result<Self::Link, AttachFailure>;
}

/// A live program attachment. Consuming `detach` makes a second release
/// unrepresentable.
pub trait Detach {
    fn detach(self) -> Result<(), AttachFailure>;
}

pub(crate) fn pod_bytes<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: `Pod` types are plain data that may be viewed as raw bytes.
    unsafe { slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

pub(crate) fn pod_from_bytes<T: Pod>(bytes: &[u8]) -> Option<T> {
    if bytes.len() != mem::size_of::<T>() {
        return None;
    }
    // SAFETY: the length matches and every bit pattern is a valid `Pod` value.
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}
