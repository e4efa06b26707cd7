//! Debug pointer verification
//!
//! Before an arena recycles its chunks, the verifier walks every record it
//! handed out and asserts that each reachable reference, slice backing and
//! map either lives inside the arena's chunks or was explicitly registered
//! as external. Verified reference and slice slots are then obfuscated so a
//! post-release dereference faults recoverably instead of reading recycled
//! memory.
//!
//! Rust has no runtime reflection, so records describe themselves through
//! the [`Scan`] visitor trait: each record type visits its pointer-bearing
//! fields through [`Traverser::field`].

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;

use thiserror::Error;

use crate::chunk::Chunk;
use crate::handle::{AMap, ASlice, AStr, Ref, POISON_LEN, SENTINEL};
use crate::logging::log_check_failure;

/// A reference-hygiene violation found by the verifier.
#[derive(Debug, Clone, Error)]
#[error("{path}: {kind}")]
pub struct CheckError {
    /// Dotted field path from the offending root record.
    pub path: String,
    pub kind: CheckErrorKind,
}

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CheckErrorKind {
    #[error("unexpected external pointer ({addr:#x})")]
    ExternalPointer { addr: usize },
    #[error("unexpected external slice backing ({addr:#x})")]
    ExternalSlice { addr: usize },
    #[error("unexpected external map ({addr:#x})")]
    ExternalMap { addr: usize },
    #[error("field accessor panicked: {message}")]
    Panicked { message: String },
}

/// External references the user registered via
/// [`Arena::keep_alive`](crate::Arena::keep_alive) (plus maps adopted by
/// [`Arena::new_map`](crate::Arena::new_map)). Addresses only; the arena
/// owns the backing separately.
#[derive(Default)]
pub(crate) struct Externals {
    pub ptr: Vec<usize>,
    pub slice: Vec<usize>,
    pub string: Vec<usize>,
    pub map: Vec<usize>,
}

impl Externals {
    pub fn clear(&mut self) {
        self.ptr.clear();
        self.slice.clear();
        self.string.clear();
        self.map.clear();
    }
}

/// Types the verifier can walk.
///
/// Implemented by the crate for scalars and all handle types. Record types
/// implement it by visiting each pointer-bearing field:
///
/// ```ignore
/// unsafe impl Scan for PbItem {
///     const IS_RECORD: bool = true;
///     fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
///         t.field("id", &mut self.id)?;
///         t.field("name", &mut self.name)?;
///         Ok(())
///     }
/// }
/// ```
///
/// # Safety
///
/// Implementors assert that (a) the all-zero byte pattern is a valid value
/// of the type (records are handed out zeroed), and (b) `scan` visits every
/// field that can hold an arena reference. Missing a field weakens
/// verification and leaves the slot un-obfuscated.
pub unsafe trait Scan {
    /// True for composite record types; such allocations are pushed onto
    /// the arena's debug scan list so the verifier can find roots.
    const IS_RECORD: bool = false;

    fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        let _ = t;
        Ok(())
    }
}

macro_rules! impl_scan_leaf {
    ($($t:ty),*) => {
        $(unsafe impl Scan for $t {})*
    };
}

impl_scan_leaf!(bool, char, i8, u8, i16, u16, i32, u32, i64, u64, i128, u128, isize, usize, f32, f64, (), AStr);

unsafe impl<T: Scan> Scan for Ref<T> {
    fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        let addr = self.as_ptr() as usize;
        if addr == 0 || addr == SENTINEL {
            return Ok(());
        }
        if !t.is_internal(addr) && !t.externals.ptr.contains(&addr) {
            return Err(t.error(CheckErrorKind::ExternalPointer { addr }));
        }
        // Mark before recursing so reference cycles terminate.
        if T::IS_RECORD && t.mark_checked(addr) {
            unsafe { (*self.as_ptr()).scan(t)? };
        }
        Ok(())
    }
}

unsafe impl<T: Scan> Scan for ASlice<T> {
    fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        if self.is_empty() || self.len() == POISON_LEN || self.data_addr() == 0 {
            return Ok(());
        }
        let addr = self.data_addr();
        if !t.is_internal(addr) && !t.externals.slice.contains(&addr) {
            return Err(t.error(CheckErrorKind::ExternalSlice { addr }));
        }
        for elem in self.as_mut_slice() {
            elem.scan(t)?;
        }
        Ok(())
    }
}

unsafe impl<K, V: Scan> Scan for AMap<K, V> {
    fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        if self.is_null() {
            return Ok(());
        }
        let addr = self.identity();
        if !t.externals.map.contains(&addr) {
            return Err(t.error(CheckErrorKind::ExternalMap { addr }));
        }
        for value in self.values_mut() {
            value.scan(t)?;
        }
        Ok(())
    }
}

unsafe impl<T: Scan, const N: usize> Scan for [T; N] {
    fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        for elem in self.iter_mut() {
            elem.scan(t)?;
        }
        Ok(())
    }
}

/// A record field the verifier can check and then obfuscate.
///
/// Implemented for the handle types and for scalars (no-op); record types
/// pass their fields to [`Traverser::field`], which checks the field and,
/// on success, poisons reference and slice slots.
pub trait Field {
    fn check(&mut self, t: &mut Traverser) -> Result<(), CheckError>;

    fn obfuscate(&mut self) {}
}

impl<T: Scan> Field for Ref<T> {
    fn check(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        self.scan(t)
    }

    fn obfuscate(&mut self) {
        self.poison();
    }
}

impl<T: Scan> Field for ASlice<T> {
    fn check(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        self.scan(t)
    }

    fn obfuscate(&mut self) {
        self.poison();
    }
}

impl<K, V: Scan> Field for AMap<K, V> {
    fn check(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        self.scan(t)
    }
}

// Array storage is intrinsic to the record, so elements are checked but the
// slots are left intact.
impl<T: Scan, const N: usize> Field for [T; N] {
    fn check(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
        self.scan(t)
    }
}

macro_rules! impl_field_leaf {
    ($($t:ty),*) => {
        $(impl Field for $t {
            fn check(&mut self, _t: &mut Traverser) -> Result<(), CheckError> {
                Ok(())
            }
        })*
    };
}

impl_field_leaf!(bool, char, i8, u8, i16, u16, i32, u32, i64, u64, i128, u128, isize, usize, f32, f64, (), AStr);

/// Walk state: chunk ranges, permitted externals, visited set, field path.
pub struct Traverser<'a> {
    chunks: &'a [Chunk],
    externals: &'a Externals,
    checked: HashSet<usize>,
    path: Vec<&'static str>,
}

impl<'a> Traverser<'a> {
    fn new(chunks: &'a [Chunk], externals: &'a Externals) -> Self {
        Self { chunks, externals, checked: HashSet::new(), path: Vec::new() }
    }

    /// Check one named field and, on success, obfuscate its slot.
    pub fn field<F: Field>(&mut self, name: &'static str, f: &mut F) -> Result<(), CheckError> {
        self.path.push(name);
        f.check(self)?;
        f.obfuscate();
        self.path.pop();
        Ok(())
    }

    fn is_internal(&self, addr: usize) -> bool {
        self.chunks.iter().any(|c| c.contains(addr))
    }

    /// Returns true when `addr` was not seen before.
    fn mark_checked(&mut self, addr: usize) -> bool {
        self.checked.insert(addr)
    }

    fn error(&self, kind: CheckErrorKind) -> CheckError {
        CheckError { path: self.path.join("."), kind }
    }
}

/// Type-erased root record pushed onto the debug scan list.
pub(crate) struct ScanObj {
    ptr: *mut u8,
    type_name: &'static str,
    scan: unsafe fn(*mut u8, &mut Traverser) -> Result<(), CheckError>,
}

impl ScanObj {
    pub fn of<T: Scan>(ptr: NonNull<T>) -> Self {
        unsafe fn scan_thunk<T: Scan>(
            p: *mut u8,
            t: &mut Traverser,
        ) -> Result<(), CheckError> {
            (*(p as *mut T)).scan(t)
        }
        Self {
            ptr: ptr.as_ptr() as *mut u8,
            type_name: short_type_name::<T>(),
            scan: scan_thunk::<T>,
        }
    }

    fn addr(&self) -> usize {
        self.ptr as usize
    }
}

fn short_type_name<T>() -> &'static str {
    std::any::type_name::<T>().rsplit("::").next().unwrap_or("?")
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Walk every recorded root, newest first, so parent slots obfuscated by a
/// later root do not stop traversal of an earlier one.
pub(crate) fn run_check(
    chunks: &[Chunk],
    externals: &Externals,
    roots: &[ScanObj],
) -> Result<(), CheckError> {
    let mut t = Traverser::new(chunks, externals);
    for obj in roots.iter().rev() {
        if !t.mark_checked(obj.addr()) {
            continue;
        }
        t.path.clear();
        t.path.push(obj.type_name);
        // Each root visit is fenced so a panicking field accessor is
        // re-raised as a fault naming the field path.
        let res = catch_unwind(AssertUnwindSafe(|| unsafe { (obj.scan)(obj.ptr, &mut t) }));
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log_check_failure(&err);
                return Err(err);
            }
            Err(payload) => {
                let err = CheckError {
                    path: t.path.join("."),
                    kind: CheckErrorKind::Panicked { message: panic_message(payload) },
                };
                log_check_failure(&err);
                return Err(err);
            }
        }
    }
    Ok(())
}
