//! Interposition shim (4.F): replaces the platform's pthread mutex, condvar,
//! spinlock, and rwlock entry points, plus `pthread_create`, with calls into
//! the uniform façade (component D). Meant to be built as a `cdylib` and
//! loaded via `LD_PRELOAD`, exactly like the original's `interpose.c`.
//!
//! Each platform object's opaque storage is overlaid with a small descriptor:
//! a one-byte status (`0` never initialized, `1` initializing, `2`
//! initialized) plus a pointer to a heap-allocated [`crate::facade::Lock`]
//! or [`crate::facade::Cond`]. First use performs a double-checked,
//! compare-exchange-gated exactly-once initialization; the explicit `*_init`
//! entry points force re-initialization by resetting status to `0` first,
//! matching `interpose_lock_init`'s `force` parameter — including its same
//! leak of whatever the descriptor previously pointed to, not newly
//! introduced here. `pthread_spinlock_t` is the one object too small to
//! hold a descriptor in place (a 4-byte `c_int` against a 16-byte
//! `LockDescriptor`); its backing locks live in an out-of-band registry
//! keyed by the spinlock's own address instead.
//!
//! Grounded in `original_source/src/interpose.c` / `include/interpose.h`.
//! `pthread_create` is the one entry point that must still forward to the
//! real implementation (to actually start a thread); every lock/condvar
//! entry point fully replaces its platform counterpart and never forwards,
//! matching the original (whose `REAL(pthread_mutex_*)` function pointers
//! are loaded but never called outside the `USE_REAL_PTHREAD` fallback).
//! ELF symbol versioning (`.symver`) on the condvar symbols is intentionally
//! not replicated; see `DESIGN.md`.

use crate::error::LockError;
use crate::facade::{Cond, Lock};
use core::ffi::c_void;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Mutex, OnceLock};

const STATUS_UNINIT: u8 = 0;
const STATUS_INITIALIZING: u8 = 1;
const STATUS_INITIALIZED: u8 = 2;

#[repr(C)]
struct LockDescriptor {
    status: AtomicU8,
    backing: AtomicPtr<Lock<()>>,
}

#[repr(C)]
struct CondDescriptor {
    status: AtomicU8,
    backing: AtomicPtr<Cond>,
}

static_assertions::const_assert!(
    core::mem::size_of::<LockDescriptor>() <= core::mem::size_of::<libc::pthread_mutex_t>()
);
static_assertions::const_assert!(
    core::mem::size_of::<CondDescriptor>() <= core::mem::size_of::<libc::pthread_cond_t>()
);

/// Runtime check mirroring the original's one debug-only `DASSERT`
/// (`sizeof(pthread_mutex_t) > sizeof(lock_as_t)`), which this crate also
/// enforces at compile time above; kept as a second, fallible check so a
/// future platform with a smaller `pthread_mutex_t` fails with
/// [`LockError::BuildMismatch`] instead of silently corrupting memory.
fn check_mutex_fits() -> Result<(), LockError> {
    let needed = core::mem::size_of::<LockDescriptor>();
    let available = core::mem::size_of::<libc::pthread_mutex_t>();
    if needed > available {
        return Err(LockError::BuildMismatch { needed, available });
    }
    Ok(())
}

fn fatal(err: LockError) -> ! {
    tracing::error!(%err, "interposition shim: fatal error");
    std::process::exit(1);
}

unsafe fn get_or_init_lock(desc: *mut LockDescriptor, force: bool) -> &'static Lock<()> {
    let d = unsafe { &*desc };
    if force {
        d.status.store(STATUS_UNINIT, Ordering::SeqCst);
    }
    loop {
        match d
            .status
            .compare_exchange(STATUS_UNINIT, STATUS_INITIALIZING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                let boxed = Box::new(Lock::<()>::new(()));
                d.backing.store(Box::into_raw(boxed), Ordering::SeqCst);
                d.status.store(STATUS_INITIALIZED, Ordering::SeqCst);
                break;
            }
            Err(STATUS_INITIALIZING) => {
                while d.status.load(Ordering::SeqCst) == STATUS_INITIALIZING {
                    core::hint::spin_loop();
                }
                break;
            }
            Err(_) => break,
        }
    }
    unsafe { &*d.backing.load(Ordering::SeqCst) }
}

unsafe fn get_or_init_cond(desc: *mut CondDescriptor, force: bool) -> &'static Cond {
    let d = unsafe { &*desc };
    if force {
        d.status.store(STATUS_UNINIT, Ordering::SeqCst);
    }
    loop {
        match d
            .status
            .compare_exchange(STATUS_UNINIT, STATUS_INITIALIZING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                let boxed = Box::new(Cond::new());
                d.backing.store(Box::into_raw(boxed), Ordering::SeqCst);
                d.status.store(STATUS_INITIALIZED, Ordering::SeqCst);
                break;
            }
            Err(STATUS_INITIALIZING) => {
                while d.status.load(Ordering::SeqCst) == STATUS_INITIALIZING {
                    core::hint::spin_loop();
                }
                break;
            }
            Err(_) => break,
        }
    }
    unsafe { &*d.backing.load(Ordering::SeqCst) }
}

macro_rules! lock_entry_points {
    ($init:ident, $destroy:ident, $lock:ident, $trylock:ident, $unlock:ident, $timedlock:ident, $opaque:ty) => {
        /// # Safety
        /// `ptr` must point to a live, correctly sized platform lock object.
        #[no_mangle]
        pub unsafe extern "C" fn $init(ptr: *mut $opaque, _attr: *const c_void) -> libc::c_int {
            if let Err(e) = check_mutex_fits() {
                fatal(e);
            }
            unsafe { get_or_init_lock(ptr as *mut LockDescriptor, true) };
            0
        }

        /// # Safety
        /// `ptr` must point to a live, correctly sized platform lock object.
        #[no_mangle]
        pub unsafe extern "C" fn $destroy(ptr: *mut $opaque) -> libc::c_int {
            let desc = unsafe { &*(ptr as *mut LockDescriptor) };
            if desc.status.load(Ordering::SeqCst) == STATUS_INITIALIZED {
                let raw = desc.backing.swap(core::ptr::null_mut(), Ordering::SeqCst);
                if !raw.is_null() {
                    drop(unsafe { Box::from_raw(raw) });
                }
                desc.status.store(STATUS_UNINIT, Ordering::SeqCst);
            }
            0
        }

        /// # Safety
        /// `ptr` must point to a live, correctly sized platform lock object.
        #[no_mangle]
        pub unsafe extern "C" fn $lock(ptr: *mut $opaque) -> libc::c_int {
            let desc = ptr as *mut LockDescriptor;
            if unsafe { (*desc).status.load(Ordering::SeqCst) } != STATUS_INITIALIZED {
                unsafe { get_or_init_lock(desc, false) };
            }
            let lock = unsafe { get_or_init_lock(desc, false) };
            let guard = lock.lock();
            core::mem::forget(guard);
            0
        }

        /// # Safety
        /// `ptr` must point to a live, correctly sized platform lock object.
        #[no_mangle]
        pub unsafe extern "C" fn $trylock(ptr: *mut $opaque) -> libc::c_int {
            let desc = ptr as *mut LockDescriptor;
            let lock = unsafe { get_or_init_lock(desc, false) };
            match lock.try_lock() {
                Ok(guard) => {
                    core::mem::forget(guard);
                    0
                }
                Err(_) => libc::EBUSY,
            }
        }

        /// # Safety
        /// `ptr` must point to a live, correctly sized platform lock object
        /// currently held by the calling thread (the original neither
        /// detects nor recovers from a release-by-non-owner; neither does
        /// this shim, per 4.C.14).
        #[no_mangle]
        pub unsafe extern "C" fn $unlock(ptr: *mut $opaque) -> libc::c_int {
            let desc = ptr as *mut LockDescriptor;
            let lock = unsafe { get_or_init_lock(desc, false) };
            lock.raw_release_for_interpose();
            0
        }

        /// # Safety
        /// `ptr` must point to a live platform lock object; unconditionally
        /// fatal, matching the original's `fprintf` + `exit(EXIT_FAILURE)`.
        #[no_mangle]
        pub unsafe extern "C" fn $timedlock(_ptr: *mut $opaque, _abstime: *const libc::timespec) -> libc::c_int {
            fatal(LockError::Unsupported("timed locks not supported"));
        }
    };
}

lock_entry_points!(
    pthread_mutex_init,
    pthread_mutex_destroy,
    pthread_mutex_lock,
    pthread_mutex_trylock,
    pthread_mutex_unlock,
    pthread_mutex_timedlock,
    libc::pthread_mutex_t
);

// `pthread_spinlock_t` is a 4-byte `c_int` on every platform this crate
// targets, too small to hold a `LockDescriptor` (16 bytes) in place the way
// `pthread_mutex_t`/`pthread_cond_t`/`pthread_rwlock_t` can — overlaying it
// would write 12 bytes past the end of the caller's object. Descriptors for
// spinlocks live out-of-band instead, keyed by the spinlock's own address.
type SpinRegistry = Mutex<HashMap<usize, Box<Lock<()>>>>;

static SPIN_REGISTRY: OnceLock<SpinRegistry> = OnceLock::new();

fn spin_registry() -> &'static SpinRegistry {
    SPIN_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up (or lazily create, or force-recreate) the backing lock for a
/// spinlock object identified by its address.
///
/// # Safety
/// `ptr` must point to a live `pthread_spinlock_t`; the returned reference
/// stays valid only until a later call with `force == true` or a call to
/// [`pthread_spin_destroy`] on the same address removes the entry.
unsafe fn get_or_init_spin(ptr: *mut libc::pthread_spinlock_t, force: bool) -> &'static Lock<()> {
    let key = ptr as usize;
    let mut registry = spin_registry().lock().unwrap();
    if force {
        registry.remove(&key);
    }
    let boxed = registry
        .entry(key)
        .or_insert_with(|| Box::new(Lock::<()>::new(())));
    // SAFETY: the box is heap-allocated and never moved while its entry
    // lives in the map; only `force` re-init or destroy drops it, both of
    // which are the caller's responsibility to not race with concurrent use
    // of the same spinlock, exactly as for the platform original.
    unsafe { &*(boxed.as_ref() as *const Lock<()>) }
}

/// # Safety
/// `ptr` must point to a live `pthread_spinlock_t`.
#[no_mangle]
pub unsafe extern "C" fn pthread_spin_init(
    ptr: *mut libc::pthread_spinlock_t,
    _pshared: libc::c_int,
) -> libc::c_int {
    unsafe { get_or_init_spin(ptr, true) };
    0
}

/// # Safety
/// `ptr` must point to a live `pthread_spinlock_t`.
#[no_mangle]
pub unsafe extern "C" fn pthread_spin_destroy(ptr: *mut libc::pthread_spinlock_t) -> libc::c_int {
    spin_registry().lock().unwrap().remove(&(ptr as usize));
    0
}

/// # Safety
/// `ptr` must point to a live `pthread_spinlock_t`.
#[no_mangle]
pub unsafe extern "C" fn pthread_spin_lock(ptr: *mut libc::pthread_spinlock_t) -> libc::c_int {
    let lock = unsafe { get_or_init_spin(ptr, false) };
    let guard = lock.lock();
    core::mem::forget(guard);
    0
}

/// # Safety
/// `ptr` must point to a live `pthread_spinlock_t`.
#[no_mangle]
pub unsafe extern "C" fn pthread_spin_trylock(ptr: *mut libc::pthread_spinlock_t) -> libc::c_int {
    let lock = unsafe { get_or_init_spin(ptr, false) };
    match lock.try_lock() {
        Ok(guard) => {
            core::mem::forget(guard);
            0
        }
        Err(_) => libc::EBUSY,
    }
}

/// # Safety
/// `ptr` must point to a live `pthread_spinlock_t` currently held by the
/// calling thread.
#[no_mangle]
pub unsafe extern "C" fn pthread_spin_unlock(ptr: *mut libc::pthread_spinlock_t) -> libc::c_int {
    let lock = unsafe { get_or_init_spin(ptr, false) };
    lock.raw_release_for_interpose();
    0
}

// Read-lock and write-lock both map to exclusive acquire of the same
// underlying lock (4.F); the timed variants are rejected at runtime.
#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_init(
    ptr: *mut libc::pthread_rwlock_t,
    _attr: *const c_void,
) -> libc::c_int {
    static_assertions::const_assert!(
        core::mem::size_of::<LockDescriptor>() <= core::mem::size_of::<libc::pthread_rwlock_t>()
    );
    unsafe { get_or_init_lock(ptr as *mut LockDescriptor, true) };
    0
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_destroy(ptr: *mut libc::pthread_rwlock_t) -> libc::c_int {
    unsafe { pthread_mutex_destroy(ptr as *mut libc::pthread_mutex_t) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_rdlock(ptr: *mut libc::pthread_rwlock_t) -> libc::c_int {
    unsafe { pthread_mutex_lock(ptr as *mut libc::pthread_mutex_t) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_wrlock(ptr: *mut libc::pthread_rwlock_t) -> libc::c_int {
    unsafe { pthread_mutex_lock(ptr as *mut libc::pthread_mutex_t) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_tryrdlock(ptr: *mut libc::pthread_rwlock_t) -> libc::c_int {
    unsafe { pthread_mutex_trylock(ptr as *mut libc::pthread_mutex_t) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_trywrlock(ptr: *mut libc::pthread_rwlock_t) -> libc::c_int {
    unsafe { pthread_mutex_trylock(ptr as *mut libc::pthread_mutex_t) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized, held platform rwlock object.
pub unsafe extern "C" fn pthread_rwlock_unlock(ptr: *mut libc::pthread_rwlock_t) -> libc::c_int {
    unsafe { pthread_mutex_unlock(ptr as *mut libc::pthread_mutex_t) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live platform rwlock object; unconditionally fatal.
pub unsafe extern "C" fn pthread_rwlock_timedrdlock(
    ptr: *mut libc::pthread_rwlock_t,
    abstime: *const libc::timespec,
) -> libc::c_int {
    unsafe { pthread_mutex_timedlock(ptr as *mut libc::pthread_mutex_t, abstime) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live platform rwlock object; unconditionally fatal.
pub unsafe extern "C" fn pthread_rwlock_timedwrlock(
    ptr: *mut libc::pthread_rwlock_t,
    abstime: *const libc::timespec,
) -> libc::c_int {
    unsafe { pthread_mutex_timedlock(ptr as *mut libc::pthread_mutex_t, abstime) }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform condvar object.
pub unsafe extern "C" fn pthread_cond_init(
    ptr: *mut libc::pthread_cond_t,
    _attr: *const c_void,
) -> libc::c_int {
    unsafe { get_or_init_cond(ptr as *mut CondDescriptor, true) };
    0
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform condvar object.
pub unsafe extern "C" fn pthread_cond_destroy(ptr: *mut libc::pthread_cond_t) -> libc::c_int {
    let desc = unsafe { &*(ptr as *mut CondDescriptor) };
    if desc.status.load(Ordering::SeqCst) == STATUS_INITIALIZED {
        let raw = desc.backing.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if !raw.is_null() {
            drop(unsafe { Box::from_raw(raw) });
        }
        desc.status.store(STATUS_UNINIT, Ordering::SeqCst);
    }
    0
}

#[no_mangle]
/// # Safety
/// `cond`/`mutex` must point to live, correctly sized platform objects.
pub unsafe extern "C" fn pthread_cond_wait(
    cond: *mut libc::pthread_cond_t,
    mutex: *mut libc::pthread_mutex_t,
) -> libc::c_int {
    let c = unsafe { get_or_init_cond(cond as *mut CondDescriptor, false) };
    let l = unsafe { get_or_init_lock(mutex as *mut LockDescriptor, false) };
    match c.wait(l) {
        Ok(()) => 0,
        Err(_) => libc::EINVAL,
    }
}

#[no_mangle]
/// # Safety
/// `cond`/`mutex` must point to live, correctly sized platform objects.
pub unsafe extern "C" fn pthread_cond_timedwait(
    cond: *mut libc::pthread_cond_t,
    mutex: *mut libc::pthread_mutex_t,
    abstime: *const libc::timespec,
) -> libc::c_int {
    let c = unsafe { get_or_init_cond(cond as *mut CondDescriptor, false) };
    let l = unsafe { get_or_init_lock(mutex as *mut LockDescriptor, false) };
    let ts = unsafe { &*abstime };
    let deadline = ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64;
    match c.timedwait(l, deadline) {
        Ok(crate::error::TimedWaitOutcome::Signaled) => 0,
        Ok(crate::error::TimedWaitOutcome::TimedOut) => libc::ETIMEDOUT,
        Err(_) => libc::EINVAL,
    }
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform condvar object.
pub unsafe extern "C" fn pthread_cond_signal(ptr: *mut libc::pthread_cond_t) -> libc::c_int {
    unsafe { get_or_init_cond(ptr as *mut CondDescriptor, false) }.signal();
    0
}

#[no_mangle]
/// # Safety
/// `ptr` must point to a live, correctly sized platform condvar object.
pub unsafe extern "C" fn pthread_cond_broadcast(ptr: *mut libc::pthread_cond_t) -> libc::c_int {
    unsafe { get_or_init_cond(ptr as *mut CondDescriptor, false) }.broadcast();
    0
}

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;
type RealPthreadCreate = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> libc::c_int;

static REAL_PTHREAD_CREATE: OnceLock<usize> = OnceLock::new();

fn real_pthread_create() -> RealPthreadCreate {
    let addr = *REAL_PTHREAD_CREATE.get_or_init(|| unsafe {
        let name = CString::new("pthread_create").unwrap();
        let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
        if sym.is_null() {
            tracing::warn!("unable to find symbol: pthread_create");
        }
        sym as usize
    });
    unsafe { core::mem::transmute::<usize, RealPthreadCreate>(addr) }
}

struct Routine {
    fct: StartRoutine,
    arg: *mut c_void,
}

extern "C" fn lp_start_routine(arg: *mut c_void) -> *mut c_void {
    let routine = unsafe { Box::from_raw(arg as *mut Routine) };
    // Assign a dense thread ID as early as possible in the new thread's
    // life, matching `lp_start_routine`'s call to `get_me`'s underlying
    // counter before running any user code.
    let _ = crate::threadctx::current_thread_id();
    (routine.fct)(routine.arg)
}

#[no_mangle]
/// # Safety
/// Same contract as the platform `pthread_create`.
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: StartRoutine,
    arg: *mut c_void,
) -> libc::c_int {
    let boxed = Box::new(Routine {
        fct: start_routine,
        arg,
    });
    let real = real_pthread_create();
    unsafe { real(thread, attr, lp_start_routine, Box::into_raw(boxed) as *mut c_void) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_fits_inside_every_platform_lock_object_that_stores_it_in_place() {
        // `pthread_spinlock_t` is deliberately excluded: it is too small to
        // hold a `LockDescriptor` on any platform, which is exactly why
        // spinlocks use the out-of-band registry instead.
        assert!(core::mem::size_of::<LockDescriptor>() <= core::mem::size_of::<libc::pthread_mutex_t>());
        assert!(core::mem::size_of::<LockDescriptor>() <= core::mem::size_of::<libc::pthread_rwlock_t>());
        assert!(core::mem::size_of::<CondDescriptor>() <= core::mem::size_of::<libc::pthread_cond_t>());
    }

    #[test]
    fn spin_registry_is_idempotent_and_force_reinit_replaces_the_entry() {
        let mut storage: libc::pthread_spinlock_t = 0;
        let ptr = &mut storage as *mut libc::pthread_spinlock_t;
        let a = unsafe { get_or_init_spin(ptr, false) as *const Lock<()> };
        let b = unsafe { get_or_init_spin(ptr, false) as *const Lock<()> };
        assert_eq!(a, b);
        let c = unsafe { get_or_init_spin(ptr, true) as *const Lock<()> };
        assert_ne!(a, c);
        unsafe { pthread_spin_destroy(ptr) };
        assert!(!spin_registry().lock().unwrap().contains_key(&(ptr as usize)));
    }

    #[test]
    fn check_mutex_fits_passes_on_this_platform() {
        assert!(check_mutex_fits().is_ok());
    }

    #[test]
    fn get_or_init_lock_is_idempotent() {
        let mut storage: libc::pthread_mutex_t = unsafe { core::mem::zeroed() };
        let desc = &mut storage as *mut _ as *mut LockDescriptor;
        let a = unsafe { get_or_init_lock(desc, false) as *const Lock<()> };
        let b = unsafe { get_or_init_lock(desc, false) as *const Lock<()> };
        assert_eq!(a, b);
    }
}
