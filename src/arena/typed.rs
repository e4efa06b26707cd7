//! Typed allocation facade
//!
//! Constructors that hand out properly typed handles to arena memory:
//! scalars, strings, records, growable slices, enums and host-tracked maps.
//! Every constructor degenerates to a pure host-heap allocation when the
//! arena is disabled, so a globally disabled allocator yields a correct
//! program with standard heap behavior.

use std::collections::HashMap;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;

use super::{Arena, ArenaInner};
use crate::chunk::PTR_SIZE;
use crate::handle::{AMap, ASlice, AStr, Numeric, Ref, POISON_LEN};
use crate::verify::{Scan, ScanObj};

impl Arena {
    fn typed_new<T: Scan>(&self, inner: &mut ArenaInner, zero: bool) -> NonNull<T> {
        assert!(
            mem::align_of::<T>() <= PTR_SIZE,
            "{} requires alignment above the pointer width",
            std::any::type_name::<T>()
        );
        let ptr = self.alloc_inner(inner, mem::size_of::<T>(), zero).cast::<T>();
        if inner.cfg.dbg_mode && T::IS_RECORD {
            inner.dbg_scan_objs.push(ScanObj::of::<T>(ptr));
        }
        ptr
    }

    /// Allocate a zeroed record of type `T`.
    ///
    /// In debug mode composite records are recorded so the verifier can use
    /// them as roots.
    pub fn new<T: Scan>(&self) -> Ref<T> {
        self.with_inner(|inner| {
            if inner.cfg.disabled {
                // Safety: Scan implementors are valid as all-zero bytes.
                let zeroed = unsafe { mem::zeroed::<T>() };
                Ref::from_raw(Self::adopt_host(inner, zeroed))
            } else {
                Ref::from_non_null(self.typed_new::<T>(inner, true))
            }
        })
    }

    /// Allocate a record whose contents are a byte-wise copy of a
    /// caller-local template.
    ///
    /// In linear mode this performs no host-heap allocation: the template
    /// stays on the caller's stack and its bytes are copied straight into
    /// the arena.
    pub fn new_from<T: Scan>(&self, template: &T) -> Ref<T> {
        self.with_inner(|inner| {
            if inner.cfg.disabled {
                let mut boxed: Box<MaybeUninit<T>> = Box::new(MaybeUninit::uninit());
                unsafe {
                    boxed.as_mut_ptr().copy_from_nonoverlapping(template as *const T, 1);
                }
                let (raw, owner) = crate::handle::HostAlloc::from_box(boxed);
                inner.host_objs.push(owner);
                Ref::from_raw(raw as *mut T)
            } else {
                let ptr = self.typed_new::<T>(inner, false);
                unsafe {
                    ptr.as_ptr().copy_from_nonoverlapping(template as *const T, 1);
                }
                Ref::from_non_null(ptr)
            }
        })
    }

    /// Allocate a scalar and write `v` into it.
    pub fn scalar<T: Scan>(&self, v: T) -> Ref<T> {
        self.with_inner(|inner| {
            if inner.cfg.disabled {
                Ref::from_raw(Self::adopt_host(inner, v))
            } else {
                let ptr = self.typed_new::<T>(inner, false);
                unsafe { ptr.as_ptr().write(v) };
                Ref::from_non_null(ptr)
            }
        })
    }

    pub fn bool(&self, v: bool) -> Ref<bool> {
        self.scalar(v)
    }

    pub fn i32(&self, v: i32) -> Ref<i32> {
        self.scalar(v)
    }

    pub fn u32(&self, v: u32) -> Ref<u32> {
        self.scalar(v)
    }

    pub fn i64(&self, v: i64) -> Ref<i64> {
        self.scalar(v)
    }

    pub fn u64(&self, v: u64) -> Ref<u64> {
        self.scalar(v)
    }

    pub fn isize(&self, v: isize) -> Ref<isize> {
        self.scalar(v)
    }

    pub fn usize(&self, v: usize) -> Ref<usize> {
        self.scalar(v)
    }

    pub fn f32(&self, v: f32) -> Ref<f32> {
        self.scalar(v)
    }

    pub fn f64(&self, v: f64) -> Ref<f64> {
        self.scalar(v)
    }

    /// Allocate an enum value, preserving its type on the handle.
    pub fn new_enum<E: Scan>(&self, e: E) -> Ref<E> {
        self.scalar(e)
    }

    /// Copy a string's UTF-8 bytes into the arena and return a view over
    /// the copy.
    pub fn str(&self, v: &str) -> AStr {
        if v.is_empty() {
            return AStr::empty();
        }
        self.with_inner(|inner| {
            if inner.cfg.disabled {
                let raw = Self::adopt_host(inner, v.to_owned());
                let data = unsafe { (*raw).as_mut_ptr() };
                AStr::from_raw_parts(data, v.len())
            } else {
                let ptr = self.alloc_inner(inner, v.len(), false);
                unsafe { ptr.as_ptr().copy_from_nonoverlapping(v.as_ptr(), v.len()) };
                AStr::from_raw_parts(ptr.as_ptr(), v.len())
            }
        })
    }

    fn slice_backing<T>(&self, inner: &mut ArenaInner, cap: usize) -> *mut T {
        assert!(
            mem::align_of::<T>() <= PTR_SIZE,
            "{} requires alignment above the pointer width",
            std::any::type_name::<T>()
        );
        if inner.cfg.disabled {
            let mut buf: Vec<MaybeUninit<T>> = Vec::with_capacity(cap);
            let data = buf.as_mut_ptr() as *mut T;
            let _ = Self::adopt_host(inner, buf);
            data
        } else {
            self.alloc_inner(inner, cap * mem::size_of::<T>(), false)
                .cast::<T>()
                .as_ptr()
        }
    }

    /// Allocate a slice of `T` with the given length and capacity.
    ///
    /// The first `len` elements are zeroed; the rest of the backing is left
    /// uninitialized until appended to.
    pub fn new_slice<T: Scan>(&self, len: usize, cap: usize) -> ASlice<T> {
        let cap = cap.max(len);
        self.with_inner(|inner| {
            let data = self.slice_backing::<T>(inner, cap);
            if len > 0 {
                unsafe { (data as *mut u8).write_bytes(0, len * mem::size_of::<T>()) };
            }
            ASlice::from_raw_parts(data, len, cap)
        })
    }

    /// Append `elem`, growing the backing inside the arena when full.
    ///
    /// Growth doubles the capacity (from a minimum of one) until it reaches
    /// 16, then multiplies by 1.5 rounding up. The old payload is
    /// byte-copied; stale copies of the header keep seeing the old backing.
    pub fn slice_append<T: Scan>(&self, slice: &mut ASlice<T>, elem: T) {
        assert!(slice.len() != POISON_LEN, "append to a released arena slice");
        self.with_inner(|inner| {
            let len = slice.len();
            if len >= slice.cap() {
                let cap = slice.cap();
                let new_cap = if cap >= 16 {
                    (cap * 3).div_ceil(2)
                } else {
                    (cap * 2).max(1)
                };
                let data = self.slice_backing::<T>(inner, new_cap);
                if len > 0 {
                    unsafe { data.copy_from_nonoverlapping(slice.data_ptr(), len) };
                }
                slice.set_parts(data, len, new_cap);
            }
            unsafe { slice.data_ptr().add(len).write(elem) };
            slice.set_len(len + 1);
        })
    }

    /// Copy a numeric slice into the arena with an exact-size backing.
    ///
    /// The copy is independent: mutating `src` afterwards does not affect
    /// the returned slice.
    pub fn copy_slice<T: Numeric + Scan>(&self, src: &[T]) -> ASlice<T> {
        self.with_inner(|inner| {
            let len = src.len();
            let data = self.slice_backing::<T>(inner, len);
            if len > 0 {
                unsafe { data.copy_from_nonoverlapping(src.as_ptr(), len) };
            }
            ASlice::from_raw_parts(data, len, len)
        })
    }

    /// Allocate a map on the host heap and track it.
    ///
    /// Maps are never backed by arena memory; the arena owns the map's
    /// lifetime (freed at reset) and records its identity so the debug
    /// verifier permits it.
    pub fn new_map<K, V>(&self) -> AMap<K, V> {
        self.with_inner(|inner| {
            let raw = Self::adopt_host(inner, HashMap::<K, V>::new());
            inner.externals.map.push(raw as usize);
            AMap::from_raw(raw)
        })
    }
}
