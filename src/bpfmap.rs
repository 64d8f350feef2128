//! # Pinned Kernel Map Client
//!
//! Typed, synchronous access to pinned kernel hash maps with 32-bit
//! keys and 64-bit values, the shape the ingress classifier consumes.
//!
//! Map dimensions are verified by parsing the kernel's per-descriptor
//! information record under `/proc/self/fdinfo`, which works on kernels
//! too old to answer object-info queries over the `bpf(2)` syscall
//! itself.
//!
//! The functions in this module are the boundary line between safe and
//! unsafe code: key and value buffers live on the stack of the calling
//! function and stay addressable for exactly the duration of the
//! syscall. The descriptor is owned by the handle and closed on drop.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::ffi::{c_long, c_void, CString};
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

// bpf(2) commands used here; see <linux/bpf.h>.
const BPF_MAP_LOOKUP_ELEM: libc::c_int = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_int = 4;
const BPF_OBJ_GET: libc::c_int = 7;

/// BPF_ANY: create or update.
const BPF_UPDATE_ANY: u64 = 0;

/// Map type code for hash maps.
const BPF_MAP_TYPE_HASH: u32 = 1;

// =============================================================================
// Capability Trait
// =============================================================================

/// Operations on an open (u32 → u64) kernel hash map.
pub trait KernelMap: Send + Sync {
    /// Single-element lookup.
    fn get(&self, key: u32) -> Result<u64>;

    /// Insert-or-update. No ordering guarantees against concurrent
    /// kernel-side producers.
    fn set(&self, key: u32, value: u64) -> Result<()>;

    /// Removes an element. Deleting an absent key is success.
    fn delete(&self, key: u32) -> Result<()>;

    /// Best-effort walk of the map: keys that vanish mid-walk are
    /// skipped, no key is reported twice, and no consistent snapshot is
    /// promised while the classifier is live.
    fn entries(&self) -> Result<Vec<(u32, u64)>>;
}

/// Opens kernel maps by pin path. Injected where the map client itself
/// must be substitutable.
pub type MapOpener = dyn Fn(&str) -> Result<Box<dyn KernelMap>> + Send + Sync;

// =============================================================================
// Syscall Plumbing
// =============================================================================

// Layouts mirror the corresponding `bpf_attr` arms. Field widths and the
// 64-bit alignment of pointer fields are part of the kernel ABI.

#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

#[repr(C)]
struct ObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn bpf_call(cmd: libc::c_int, attr: *mut c_void, size: usize) -> std::io::Result<c_long> {
    // SAFETY: attr points at a properly sized, initialised attribute
    // struct that outlives the call.
    let rc = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn is_enoent(error: &std::io::Error) -> bool {
    error.raw_os_error() == Some(libc::ENOENT)
}

// =============================================================================
// Pinned Map Handle
// =============================================================================

/// Handle to a pinned (u32 → u64) hash map.
pub struct PinnedMap {
    fd: OwnedFd,
}

impl PinnedMap {
    /// Opens a map pinned at `pin_path` (under a bpffs mountpoint) and
    /// verifies it is a hash map with 4-byte keys and 8-byte values.
    pub fn open(pin_path: &str) -> Result<Self> {
        let path = CString::new(pin_path).map_err(|_| Error::WrongMapShape {
            pin: pin_path.to_string(),
            reason: "pin path contains NUL".to_string(),
        })?;

        let mut attr = ObjGetAttr {
            pathname: path.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: 0,
        };
        let raw = bpf_call(
            BPF_OBJ_GET,
            &mut attr as *mut _ as *mut c_void,
            std::mem::size_of::<ObjGetAttr>(),
        )
        .map_err(|source| Error::Syscall {
            operation: "bpf(OBJ_GET)",
            source,
        })?;

        // SAFETY: a non-negative return from BPF_OBJ_GET is a fresh fd
        // we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw as i32) };

        let info = fs::read_to_string(format!("/proc/self/fdinfo/{}", fd.as_raw_fd()))
            .map_err(|e| Error::WrongMapShape {
                pin: pin_path.to_string(),
                reason: format!("cannot read fdinfo: {e}"),
            })?;
        validate_map_shape(pin_path, &info)?;

        Ok(Self { fd })
    }

    fn map_fd(&self) -> u32 {
        self.fd.as_raw_fd() as u32
    }

    fn next_key(&self, key: u32) -> std::io::Result<u32> {
        let key_store: u32 = key;
        let mut next: u32 = 0;
        let mut attr = MapElemAttr {
            map_fd: self.map_fd(),
            _pad: 0,
            key: &key_store as *const u32 as u64,
            value_or_next_key: &mut next as *mut u32 as u64,
            flags: 0,
        };
        bpf_call(
            BPF_MAP_GET_NEXT_KEY,
            &mut attr as *mut _ as *mut c_void,
            std::mem::size_of::<MapElemAttr>(),
        )?;
        Ok(next)
    }

    fn lookup(&self, key: u32) -> std::io::Result<u64> {
        let key_store: u32 = key;
        let mut value: u64 = 0;
        let mut attr = MapElemAttr {
            map_fd: self.map_fd(),
            _pad: 0,
            key: &key_store as *const u32 as u64,
            value_or_next_key: &mut value as *mut u64 as u64,
            flags: 0,
        };
        bpf_call(
            BPF_MAP_LOOKUP_ELEM,
            &mut attr as *mut _ as *mut c_void,
            std::mem::size_of::<MapElemAttr>(),
        )?;
        Ok(value)
    }
}

impl KernelMap for PinnedMap {
    fn get(&self, key: u32) -> Result<u64> {
        self.lookup(key).map_err(|source| {
            if is_enoent(&source) {
                Error::MapEntryNotFound(key)
            } else {
                Error::Syscall {
                    operation: "bpf(MAP_LOOKUP_ELEM)",
                    source,
                }
            }
        })
    }

    fn set(&self, key: u32, value: u64) -> Result<()> {
        let key_store: u32 = key;
        let value_store: u64 = value;
        let mut attr = MapElemAttr {
            map_fd: self.map_fd(),
            _pad: 0,
            key: &key_store as *const u32 as u64,
            value_or_next_key: &value_store as *const u64 as u64,
            flags: BPF_UPDATE_ANY,
        };
        bpf_call(
            BPF_MAP_UPDATE_ELEM,
            &mut attr as *mut _ as *mut c_void,
            std::mem::size_of::<MapElemAttr>(),
        )
        .map_err(|source| Error::Syscall {
            operation: "bpf(MAP_UPDATE_ELEM)",
            source,
        })?;
        Ok(())
    }

    fn delete(&self, key: u32) -> Result<()> {
        let key_store: u32 = key;
        let mut attr = MapElemAttr {
            map_fd: self.map_fd(),
            _pad: 0,
            key: &key_store as *const u32 as u64,
            value_or_next_key: 0,
            flags: 0,
        };
        match bpf_call(
            BPF_MAP_DELETE_ELEM,
            &mut attr as *mut _ as *mut c_void,
            std::mem::size_of::<MapElemAttr>(),
        ) {
            Ok(_) => Ok(()),
            Err(source) if is_enoent(&source) => Ok(()),
            Err(source) => Err(Error::Syscall {
                operation: "bpf(MAP_DELETE_ELEM)",
                source,
            }),
        }
    }

    fn entries(&self) -> Result<Vec<(u32, u64)>> {
        walk_entries(|key| self.next_key(key), |key| self.lookup(key)).map_err(|source| {
            Error::Syscall {
                operation: "bpf(MAP_GET_NEXT_KEY)",
                source,
            }
        })
    }
}

/// Walks a map by chaining next-key calls starting from key 0.
///
/// A lookup can fail when the key vanished between the next-key call
/// and now; the walk recovers by moving on. The result is a best-effort
/// snapshot with no key reported twice.
fn walk_entries<N, L>(mut next_key: N, mut lookup: L) -> std::io::Result<Vec<(u32, u64)>>
where
    N: FnMut(u32) -> std::io::Result<u32>,
    L: FnMut(u32) -> std::io::Result<u64>,
{
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: u32 = 0;

    loop {
        let next = match next_key(cursor) {
            Ok(next) => next,
            Err(source) if is_enoent(&source) => break,
            Err(source) => return Err(source),
        };

        if seen.insert(next) {
            if let Ok(value) = lookup(next) {
                out.push((next, value));
            }
        }
        cursor = next;
    }

    Ok(out)
}

// =============================================================================
// Shape Validation
// =============================================================================

/// Checks a procfs fdinfo record for hash type, 4-byte keys, and 8-byte
/// values.
fn validate_map_shape(pin: &str, fdinfo: &str) -> Result<()> {
    let mut map_type: Option<u32> = None;
    let mut key_size: Option<u32> = None;
    let mut value_size: Option<u32> = None;

    for line in fdinfo.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let parsed = value.trim().parse::<u32>().ok();
        match field {
            "map_type" => map_type = parsed,
            "key_size" => key_size = parsed,
            "value_size" => value_size = parsed,
            _ => {}
        }
    }

    let (Some(map_type), Some(key_size), Some(value_size)) = (map_type, key_size, value_size)
    else {
        return Err(Error::WrongMapShape {
            pin: pin.to_string(),
            reason: "fdinfo is missing map_type/key_size/value_size".to_string(),
        });
    };

    if map_type != BPF_MAP_TYPE_HASH {
        return Err(Error::WrongMapShape {
            pin: pin.to_string(),
            reason: format!("map_type {map_type}, only hash maps (1) are supported"),
        });
    }
    if key_size != 4 {
        return Err(Error::WrongMapShape {
            pin: pin.to_string(),
            reason: format!("key_size {key_size}, all keys must be 4 bytes"),
        });
    }
    if value_size != 8 {
        return Err(Error::WrongMapShape {
            pin: pin.to_string(),
            reason: format!("value_size {value_size}, all values must be 8 bytes"),
        });
    }

    Ok(())
}

/// Opens a pinned map, boxing it behind the [`KernelMap`] capability.
pub fn open_pinned_map(pin_path: &str) -> Result<Box<dyn KernelMap>> {
    Ok(Box::new(PinnedMap::open(pin_path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_FDINFO: &str = "pos:\t0\nflags:\t02000002\nmnt_id:\t15\n\
                               map_type:\t1\nkey_size:\t4\nvalue_size:\t8\n\
                               max_entries:\t2\nmap_flags:\t0x0\n";

    #[test]
    fn fdinfo_with_expected_shape_passes() {
        assert!(validate_map_shape("/pin", GOOD_FDINFO).is_ok());
    }

    #[test]
    fn fdinfo_with_array_type_is_refused() {
        let info = GOOD_FDINFO.replace("map_type:\t1", "map_type:\t2");
        let err = validate_map_shape("/pin", &info).unwrap_err();
        assert!(matches!(err, Error::WrongMapShape { .. }));
    }

    #[test]
    fn fdinfo_with_wide_keys_is_refused() {
        let info = GOOD_FDINFO.replace("key_size:\t4", "key_size:\t8");
        assert!(validate_map_shape("/pin", &info).is_err());
    }

    #[test]
    fn fdinfo_with_narrow_values_is_refused() {
        let info = GOOD_FDINFO.replace("value_size:\t8", "value_size:\t4");
        assert!(validate_map_shape("/pin", &info).is_err());
    }

    #[test]
    fn truncated_fdinfo_is_refused() {
        let err = validate_map_shape("/pin", "pos:\t0\nflags:\t02\n").unwrap_err();
        assert!(matches!(err, Error::WrongMapShape { .. }));
    }

    #[test]
    fn attr_layout_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<MapElemAttr>(), 32);
        assert_eq!(std::mem::size_of::<ObjGetAttr>(), 16);
    }

    fn enoent() -> std::io::Error {
        std::io::Error::from_raw_os_error(libc::ENOENT)
    }

    /// Drives `walk_entries` the way the kernel would: next-key after an
    /// unknown key restarts at the front, the end reports no-such-entry.
    fn scripted_next_key(keys: &[u32]) -> impl FnMut(u32) -> std::io::Result<u32> + '_ {
        move |cursor| {
            let position = keys.iter().position(|k| *k == cursor);
            let next = match position {
                Some(i) => keys.get(i + 1),
                None => keys.first(),
            };
            next.copied().ok_or_else(enoent)
        }
    }

    #[test]
    fn walk_yields_exactly_the_inserted_pairs() {
        let keys = [7u32, 3, 12, 9];
        let entries = walk_entries(scripted_next_key(&keys), |k| Ok(u64::from(k) * 10)).unwrap();

        let mut got = entries.clone();
        got.sort_unstable();
        assert_eq!(got, vec![(3, 30), (7, 70), (9, 90), (12, 120)]);

        let unique: HashSet<u32> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(unique.len(), entries.len(), "no key may be reported twice");
    }

    #[test]
    fn walk_skips_keys_that_vanish_mid_walk() {
        let keys = [7u32, 3, 12];
        let entries = walk_entries(scripted_next_key(&keys), |k| {
            if k == 3 {
                Err(enoent())
            } else {
                Ok(u64::from(k))
            }
        })
        .unwrap();

        let mut got = entries.clone();
        got.sort_unstable();
        assert_eq!(got, vec![(7, 7), (12, 12)]);
    }

    #[test]
    fn walk_of_empty_map_is_empty() {
        let entries = walk_entries(|_| Err(enoent()), |_| panic!("no keys to look up")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn walk_surfaces_unexpected_next_key_failures() {
        let result = walk_entries(
            |_| Err(std::io::Error::from_raw_os_error(libc::EPERM)),
            |_| unreachable!(),
        );
        assert!(result.is_err());
    }
}
