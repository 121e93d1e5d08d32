use std::{
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ops::Deref,
    process::abort,
    ptr::{self, NonNull},
    sync::atomic::{fence, AtomicUsize, Ordering},
};

/// Live handles beyond this count abort the process instead of wrapping the counter.
const MAX_REF_COUNT: usize = isize::MAX as usize;

/// A thread-safe reference-counted pointer with an explicit, separately allocated counter.
///
/// A `SharedHandle<T>` is either *empty* (no payload, no counter) or *populated*
/// (a counter shared by every handle that owns the same payload). Cloning a populated
/// handle increments the shared counter; dropping or resetting one decrements it, and the
/// handle that brings it to zero frees both the payload and the counter.
///
/// Only the counter is synchronized. Shared handles hand out `&T`, so mutation of a
/// shared payload needs interior mutability inside `T`.
///
/// A handle built from a null raw pointer still allocates a counter: it reports
/// [`is_null`](SharedHandle::is_null) but not [`is_empty`](SharedHandle::is_empty), and
/// its [`ref_count`](SharedHandle::ref_count) starts at 1.
///
/// `SharedHandle<T>` dereferences to `T`, so the operations that could collide with the
/// payload's own methods are associated functions: `SharedHandle::take(&mut h)`, not
/// `h.take()`.
pub struct SharedHandle<T> {
    // `*const` keeps the handle covariant in `T`.
    value: *const T,
    count: Option<NonNull<AtomicUsize>>,
    _marker: PhantomData<T>,
}

// Any owner may drop `T`, and any owner may read it through `&T`.
unsafe impl<T: Send + Sync> Send for SharedHandle<T> {}
unsafe impl<T: Send + Sync> Sync for SharedHandle<T> {}

impl<T> SharedHandle<T> {
    /// Creates a handle that owns nothing.
    #[inline(always)]
    pub const fn empty() -> Self {
        Self {
            value: ptr::null(),
            count: None,
            _marker: PhantomData,
        }
    }

    /// Moves `value` to the heap and makes the new handle its sole owner.
    #[inline]
    pub fn new(value: T) -> Self {
        Self::from(Box::new(value))
    }

    /// Takes ownership of `ptr` with a fresh counter set to 1.
    ///
    /// A null `ptr` is accepted and still allocates a counter.
    ///
    /// # Safety
    /// `ptr` must be null or come from [`Box::into_raw`], and must not be owned, used or
    /// freed by anything else afterwards.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            value: ptr,
            count: Some(new_counter()),
            _marker: PhantomData,
        }
    }

    /// Moves the ownership out of `this`, leaving it empty. The counter is not touched.
    #[inline]
    pub fn take(this: &mut Self) -> Self {
        mem::take(this)
    }

    /// Releases the current payload and shares the one owned by `other`.
    #[inline]
    pub fn assign(&mut self, other: &Self) {
        self.clone_from(other);
    }

    /// Releases the current payload and adopts the one owned by `other`.
    ///
    /// `other` receives what `self` held after the release, so it always ends up empty.
    pub fn move_assign(&mut self, other: &mut Self) {
        self.reset();
        mem::swap(self, other);
    }

    /// Returns true if the payload pointer is null.
    ///
    /// Empty handles are null, but so are handles built from a null raw pointer.
    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Returns true if the payload pointer is non-null.
    #[inline(always)]
    pub fn is_some(&self) -> bool {
        !self.is_null()
    }

    /// Returns true if the handle holds no counter at all.
    #[inline(always)]
    pub fn is_empty(this: &Self) -> bool {
        this.count.is_none()
    }

    /// Returns the raw payload pointer (null if empty) without touching the ownership.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut T {
        self.value as *mut T
    }

    #[inline(always)]
    pub fn as_ref(this: &Self) -> Option<&T> {
        // Safety: a non-null payload stays alive while `this` holds a count on it.
        unsafe { this.value.as_ref() }
    }

    /// Returns a mutable reference to the payload if no other handle shares it.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if this.ref_count() != 1 {
            return None;
        }
        // Safety: the count is 1 and `this` is borrowed mutably, so no other owner exists
        // and none can appear.
        unsafe { (this.value as *mut T).as_mut() }
    }

    /// Returns the payload if `this` is its sole owner, otherwise gives the handle back.
    pub fn try_unwrap(this: Self) -> Result<T, Self> {
        let count = match this.count {
            Some(count) => count,
            None => return Err(this),
        };
        if this.is_null() {
            return Err(this);
        }
        // Safety: the counter outlives every handle that holds it.
        if unsafe { count.as_ref() }
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(this);
        }
        let this = ManuallyDrop::new(this);
        // Safety: the count went from 1 to 0 here, so both allocations are ours alone.
        unsafe {
            drop(Box::from_raw(count.as_ptr()));
            Ok(*Box::from_raw(this.value as *mut T))
        }
    }

    /// Returns true if both handles share one counter. Two empty handles are equal.
    #[inline(always)]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.count == other.count
    }

    /// Returns the number of handles owning the payload, or 0 if empty.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.counter()
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Releases the current ownership and leaves `self` empty.
    ///
    /// If this was the last owner, the payload and the counter are freed.
    /// Does nothing on an empty handle.
    pub fn reset(&mut self) {
        let value = mem::replace(&mut self.value, ptr::null()) as *mut T;
        if let Some(count) = self.count.take() {
            // Safety: `self` owned one count on this group, which is now given up.
            unsafe { release(value, count) };
        }
    }

    /// Releases the current ownership, then takes ownership of `ptr` with a new counter.
    ///
    /// # Safety
    /// Same as [`SharedHandle::from_raw`].
    pub unsafe fn reset_raw(&mut self, ptr: *mut T) {
        self.reset();
        self.value = ptr as *const T;
        self.count = Some(new_counter());
    }

    /// Releases the current ownership, then owns a fresh heap copy of `value`.
    pub fn reset_with(&mut self, value: T) {
        // Safety: the pointer comes straight from `Box::into_raw`.
        unsafe { self.reset_raw(Box::into_raw(Box::new(value))) }
    }

    #[inline(always)]
    fn counter(&self) -> Option<&AtomicUsize> {
        // Safety: the counter outlives every handle that holds it.
        self.count.map(|count| unsafe { count.as_ref() })
    }
}

#[inline]
fn new_counter() -> NonNull<AtomicUsize> {
    NonNull::from(Box::leak(Box::new(AtomicUsize::new(1))))
}

/// Gives up one count on a group, freeing the payload and the counter on the last one.
///
/// # Safety
/// The caller must own one count on `count`, and `value` must be the payload of that group.
unsafe fn release<T>(value: *mut T, count: NonNull<AtomicUsize>) {
    if count.as_ref().fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    // Synchronize with every earlier release before freeing.
    fence(Ordering::Acquire);
    drop(Box::from_raw(count.as_ptr()));
    if !value.is_null() {
        drop(Box::from_raw(value));
    }
}

impl<T> Clone for SharedHandle<T> {
    #[inline]
    fn clone(&self) -> Self {
        if let Some(count) = self.counter() {
            // A new owner is always derived from a live one, so no ordering is needed here.
            if count.fetch_add(1, Ordering::Relaxed) > MAX_REF_COUNT {
                abort();
            }
        }
        Self {
            value: self.value,
            count: self.count,
            _marker: PhantomData,
        }
    }

    /// Shares `source`'s payload. The new count is taken before the old one is released,
    /// so handles of one group never free their own payload.
    fn clone_from(&mut self, source: &Self) {
        if Self::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T> Drop for SharedHandle<T> {
    #[inline]
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> Default for SharedHandle<T> {
    #[inline(always)]
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for SharedHandle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        match Self::as_ref(self) {
            Some(value) => value,
            None => panic!("dereferenced a SharedHandle without a payload"),
        }
    }
}

impl<T> From<Box<T>> for SharedHandle<T> {
    fn from(value: Box<T>) -> Self {
        // Safety: pointer is obtained from Box::into_raw().
        unsafe { Self::from_raw(Box::into_raw(value)) }
    }
}

impl<T> From<T> for SharedHandle<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T> PartialEq for SharedHandle<T> {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T> Eq for SharedHandle<T> {}

impl<T: fmt::Debug> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("value", &Self::as_ref(self))
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl<T> fmt::Pointer for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.value, f)
    }
}
