//! Ordered thread lists
//!
//! Every kernel list of threads (the runnable list and each primitive's
//! blocked list) is a [`ThreadList`]: an intrusive doubly-linked list of
//! thread control blocks kept in descending effective-priority order, FIFO
//! within equal priority. A list is tagged with a [`ThreadSt`]; splicing a
//! thread into a list stamps the tag onto the thread, so a thread's state
//! always names the list that holds it.
//!
//! A thread is linked into at most one `ThreadList` at a time. The thread
//! records its current list in [`ThreadListData::owner`], which is what allows
//! wakers (timeouts, signals) to detach a thread from whatever it's blocked
//! on without knowing the owning primitive.
use core::{fmt, ptr::NonNull};

use crate::{
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    thread::{ThreadCb, ThreadSt},
    utils::Init,
    PortThreading,
};

/// Links to the neighbor threads within a [`ThreadList`].
pub(crate) struct ListLink<Traits: PortThreading> {
    prev: Option<&'static ThreadCb<Traits>>,
    next: Option<&'static ThreadCb<Traits>>,
}

impl<Traits: PortThreading> Clone for ListLink<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for ListLink<Traits> {}

/// A non-owning reference to a [`ThreadList`].
pub(crate) struct ListRef<Traits: PortThreading>(NonNull<ThreadList<Traits>>);

// Safety: `ThreadList` is `Send + Sync`, and the pointee is `'static`
unsafe impl<Traits: PortThreading> Send for ListRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for ListRef<Traits> {}

impl<Traits: PortThreading> Clone for ListRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for ListRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for ListRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ListRef").field(&self.0).finish()
    }
}

impl<Traits: PortThreading> PartialEq for ListRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<Traits: PortThreading> Eq for ListRef<Traits> {}

impl<Traits: PortThreading> ListRef<Traits> {
    fn new(list: &'static ThreadList<Traits>) -> Self {
        Self(list.into())
    }

    /// Dereference the list reference.
    fn get(self) -> &'static ThreadList<Traits> {
        // Safety: `ListRef` is only ever constructed from `&'static`
        // references, and kernel objects are never deallocated
        unsafe { self.0.as_ref() }
    }
}

/// The intrusive portion of a thread control block used by [`ThreadList`].
pub(crate) struct ThreadListData<Traits: PortThreading> {
    /// `Some(_)` iff the thread is linked into a list.
    link: CpuLockCell<Traits, Option<ListLink<Traits>>>,

    /// The list that currently holds this thread.
    pub(crate) owner: CpuLockCell<Traits, Option<ListRef<Traits>>>,
}

impl<Traits: PortThreading> Init for ThreadListData<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        link: Init::INIT,
        owner: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for ThreadListData<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadListData")
            .field(
                "linked",
                &self.link.debug_fmt_with(|x, f| x.is_some().fmt(f)),
            )
            .finish()
    }
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// An ordered list of threads, tagged with the state it stamps on its
/// elements.
///
/// Ordering invariant: for any two entries, the predecessor's effective
/// priority is greater than or equal to the successor's. Equal priority
/// preserves insertion order:
///
/// ```svgbob
///  head                                              tail
///   |                                                 |
///   v                                                 v
/// .-----.    .-----.    .-----.    .-----.    .-----.
/// | p=7 |<-->| p=5 |<-->| p=5 |<-->| p=5 |<-->| p=2 |
/// '-----'    '-----'    '-----'    '-----'    '-----'
///               ^          ^          ^
///               '---- insertion order within the band
/// ```
pub(crate) struct ThreadList<Traits: PortThreading> {
    head: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,
    tail: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,
    tag: ThreadSt,
}

impl<Traits: PortThreading> ThreadList<Traits> {
    /// Construct an empty `ThreadList` stamping `tag` on inserted threads.
    pub(crate) const fn new(tag: ThreadSt) -> Self {
        Self {
            head: CpuLockCell::new(None),
            tail: CpuLockCell::new(None),
            tag,
        }
    }

    /// Get the first (highest-priority, earliest-inserted) thread.
    pub(crate) fn first(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.head.get(&*lock)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.head.get(&*lock).is_none()
    }

    /// Insert `thread` at the back of its effective-priority band, stamping
    /// the thread's state with this list's tag.
    ///
    /// The thread must not be linked into any list.
    #[inline]
    pub(crate) fn insert(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        self.insert_inner(lock, thread, false);
    }

    /// As [`Self::insert`], but the thread goes in front of its
    /// effective-priority band instead. Used when a preempted thread must
    /// keep its turn.
    #[inline]
    pub(crate) fn insert_front_of_band(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        self.insert_inner(lock, thread, true);
    }

    fn insert_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
        front_of_band: bool,
    ) {
        debug_assert!(thread.list_data.link.read(&*lock).is_none());
        debug_assert!(thread.list_data.owner.read(&*lock).is_none());

        let priority = thread.effective_priority.get(&*lock);

        // Scan from the back for the last entry that must stay in front of
        // `thread`; the new entry goes right after it. Entries of the
        // thread's own priority band stay in front of it unless
        // `front_of_band` was requested.
        let mut next = None;
        let mut cursor = self.tail.get(&*lock);
        while let Some(c) = cursor {
            let c_priority = c.effective_priority.get(&*lock);
            if c_priority < priority || (front_of_band && c_priority == priority) {
                next = Some(c);
                // The cursor is linked, so `link` must be `Some(_)`
                cursor = c.list_data.link.get(&*lock).unwrap().prev;
            } else {
                break;
            }
        }

        let prev = match next {
            Some(n) => n.list_data.link.get(&*lock).unwrap().prev,
            None => self.tail.get(&*lock),
        };

        thread
            .list_data
            .link
            .replace(&mut *lock, Some(ListLink { prev, next }));

        match prev {
            Some(p) => {
                p.list_data.link.write(&mut *lock).as_mut().unwrap().next = Some(thread);
            }
            None => {
                self.head.replace(&mut *lock, Some(thread));
            }
        }

        match next {
            Some(n) => {
                n.list_data.link.write(&mut *lock).as_mut().unwrap().prev = Some(thread);
            }
            None => {
                self.tail.replace(&mut *lock, Some(thread));
            }
        }

        thread
            .list_data
            .owner
            .replace(&mut *lock, Some(ListRef::new(self)));
        thread.st.replace(&mut *lock, self.tag);
    }

    /// Unlink `thread` from this list. The thread's state is left untouched;
    /// the caller is responsible for transitioning it.
    pub(crate) fn remove(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        let owner = thread.list_data.owner.replace(&mut *lock, None);
        debug_assert_eq!(owner, Some(ListRef::new(self)));

        // The thread is linked, so `link` must be `Some(_)`
        let link = thread.list_data.link.replace(&mut *lock, None).unwrap();

        match link.prev {
            Some(p) => {
                p.list_data.link.write(&mut *lock).as_mut().unwrap().next = link.next;
            }
            None => {
                self.head.replace(&mut *lock, link.next);
            }
        }

        match link.next {
            Some(n) => {
                n.list_data.link.write(&mut *lock).as_mut().unwrap().prev = link.prev;
            }
            None => {
                self.tail.replace(&mut *lock, link.prev);
            }
        }
    }

    /// Remove and return the first thread.
    pub(crate) fn pop_first(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        let first = self.head.get(&*lock)?;
        self.remove(lock.borrow_mut(), first);
        Some(first)
    }

    /// Reposition `thread` after a change in its effective priority. The
    /// thread moves to the back of its new priority band.
    pub(crate) fn reorder(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        self.remove(lock.borrow_mut(), thread);
        self.insert(lock.borrow_mut(), thread);
    }

    /// Call `f` for each thread, front to back.
    #[cfg(test)]
    pub(crate) fn for_each(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut f: impl FnMut(CpuLockTokenRefMut<'_, Traits>, &'static ThreadCb<Traits>),
    ) {
        let mut cursor = self.head.get(&*lock);
        while let Some(c) = cursor {
            // Find the next thread before `f` possibly unlinks `c`
            cursor = c.list_data.link.get(&*lock).unwrap().next;
            f(lock.borrow_mut(), c);
        }
    }
}

/// Get the list that currently holds `thread`, if any.
pub(crate) fn owner_of<Traits: PortThreading>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &ThreadCb<Traits>,
) -> Option<&'static ThreadList<Traits>> {
    thread.list_data.owner.get(&*lock).map(ListRef::get)
}

impl<Traits: crate::KernelTraits> fmt::Debug for ThreadList<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        struct ThreadListPrinter<'a, Traits: crate::KernelTraits>(&'a ThreadList<Traits>);

        impl<Traits: crate::KernelTraits> fmt::Debug for ThreadListPrinter<'_, Traits> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let Ok(lock) = lock_cpu::<Traits>() else {
                    return f.write_str("< locked >");
                };

                let mut list = f.debug_list();
                let mut cursor = self.0.head.get(&*lock);
                while let Some(c) = cursor {
                    list.entry(&(c as *const ThreadCb<Traits>));
                    cursor = c.list_data.link.get(&*lock).unwrap().next;
                }
                list.finish()
            }
        }

        f.debug_struct("ThreadList")
            .field("tag", &self.tag)
            .field("threads", &ThreadListPrinter(self))
            .finish()
    }
}
