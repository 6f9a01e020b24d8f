//! Intrusive doubly linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! Elements are referred to by an index into the pool (a slice position for
//! timer control blocks, a pointer wrapper for wait objects), so a link never
//! holds a reference to its neighbors. The list is circular: the first
//! element's `prev` is the last element.
use core::{convert::Infallible, fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A cell whose contents can be copied out and written back by presenting a
/// `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

#[cfg(test)]
impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InsertError<InconsistentError> {
    AlreadyLinked,
    Inconsistent(InconsistentError),
}

impl<InconsistentError> From<InconsistentError> for InsertError<InconsistentError> {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ItemError<InconsistentError> {
    NotLinked,
    Inconsistent(InconsistentError),
}

impl<InconsistentError> From<InconsistentError> for ItemError<InconsistentError> {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

pub trait HandleInconsistency {
    /// The error type to be returned by `ListAccessorCell`'s methods when
    /// structural inconsistency is detected.
    type Output;

    fn on_inconsistency(&self) -> Self::Output;
}

/// Responds to structural inconsistency by returning [`InconsistentError`].
pub struct HandleInconsistencyByReturningError;

/// Unsafely assumes the absence of structural inconsistency.
pub struct HandleInconsistencyUnchecked {
    _private_ctor: (),
}

/// An error type indicating inconsistency in a linked list structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistentError;

impl HandleInconsistency for HandleInconsistencyByReturningError {
    type Output = InconsistentError;

    #[inline(always)]
    fn on_inconsistency(&self) -> Self::Output {
        InconsistentError
    }
}

impl HandleInconsistency for HandleInconsistencyUnchecked {
    type Output = Infallible;

    #[inline(always)]
    fn on_inconsistency(&self) -> Self::Output {
        if cfg!(debug_assertions) {
            panic!("linked list is inconsistent");
        }
        // Safety: `HandleInconsistencyUnchecked` can only be obtained through
        //         `ListAccessorCell::unchecked`, whose caller vouches for the
        //         list's structural soundness
        unsafe { core::hint::unreachable_unchecked() }
    }
}

/// `Cell`-based accessor to a linked list.
#[derive(Debug)]
pub struct ListAccessorCell<
    'a,
    HeadCell,
    Pool: ?Sized,
    MapLink,
    CellKey,
    InconsistencyHandler = HandleInconsistencyByReturningError,
> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
    inconsistency_handler: InconsistencyHandler,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, HandleInconsistencyByReturningError>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
            inconsistency_handler: HandleInconsistencyByReturningError,
        }
    }

    /// Unsafely assume the list is structurally sound.
    ///
    /// # Safety
    ///
    /// The underlying list structure must be consistent. Any operations and
    /// states that would cause [`InconsistentError`] will now cause an
    /// undefined behavior.
    pub unsafe fn unchecked(
        self,
    ) -> ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, HandleInconsistencyUnchecked> {
        ListAccessorCell {
            head: self.head,
            pool: self.pool,
            map_link: self.map_link,
            cell_key: self.cell_key,
            inconsistency_handler: HandleInconsistencyUnchecked { _private_ctor: () },
        }
    }
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey, InconsistencyHandler>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey, InconsistencyHandler>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element> + ?Sized,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
    InconsistencyHandler: HandleInconsistency,
{
    fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    fn set_first(&mut self, first: Option<Index>) {
        self.head.set(&mut self.cell_key, ListHead { first });
    }

    /// Read the link of an element that must be linked.
    fn link_of(&self, item: Index) -> Result<Link<Index>, InconsistencyHandler::Output> {
        (self.map_link)(&self.pool[item])
            .get(&self.cell_key)
            .ok_or_else(|| self.inconsistency_handler.on_inconsistency())
    }

    /// Apply `f` to the link of an element that must be linked.
    fn update_link(
        &mut self,
        item: Index,
        f: impl FnOnce(&mut Link<Index>),
    ) -> Result<(), InconsistencyHandler::Output> {
        let link_cell = (self.map_link)(&self.pool[item]);
        let linked = link_cell.modify(&mut self.cell_key, |link| match link {
            Some(link) => {
                f(link);
                true
            }
            None => false,
        });
        if linked {
            Ok(())
        } else {
            Err(self.inconsistency_handler.on_inconsistency())
        }
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    /// Check if `item` is linked to any list sharing this accessor's pool.
    #[inline]
    pub fn is_linked(&self, item: Index) -> bool {
        (self.map_link)(&self.pool[item])
            .get(&self.cell_key)
            .is_some()
    }

    #[inline]
    pub fn front(&self) -> Result<Option<Index>, InconsistencyHandler::Output> {
        Ok(self.head().first)
    }

    /// Insert `item` before `at`, or at the back if `at` is `None`.
    pub fn insert(
        &mut self,
        item: Index,
        at: Option<Index>,
    ) -> Result<(), InsertError<InconsistencyHandler::Output>> {
        if self.is_linked(item.clone()) {
            return Err(InsertError::AlreadyLinked);
        }

        let Some(first) = self.head().first else {
            debug_assert!(at.is_none());
            (self.map_link)(&self.pool[item.clone()]).set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );
            self.set_first(Some(item));
            return Ok(());
        };

        // Inserting before the first element makes `item` the new first
        // element. Inserting at the back is inserting before `first` without
        // moving the head.
        let becomes_first = at.as_ref() == Some(&first);
        let next = at.unwrap_or(first);
        let prev = self.link_of(next.clone())?.prev;

        self.update_link(prev.clone(), |l| l.next = item.clone())?;
        self.update_link(next.clone(), |l| l.prev = item.clone())?;
        (self.map_link)(&self.pool[item.clone()])
            .set(&mut self.cell_key, Some(Link { prev, next }));

        if becomes_first {
            self.set_first(Some(item));
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(
        &mut self,
        item: Index,
    ) -> Result<(), InsertError<InconsistencyHandler::Output>> {
        self.insert(item, None)
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(
        &mut self,
        item: Index,
    ) -> Result<Index, ItemError<InconsistencyHandler::Output>> {
        let Some(link) = (self.map_link)(&self.pool[item.clone()]).get(&self.cell_key) else {
            return Err(ItemError::NotLinked);
        };

        if link.next == item {
            // `item` was the only element
            self.set_first(None);
        } else {
            if self.head().first.as_ref() == Some(&item) {
                self.set_first(Some(link.next.clone()));
            }
            self.update_link(link.prev.clone(), |l| l.next = link.next.clone())?;
            self.update_link(link.next.clone(), |l| l.prev = link.prev.clone())?;
        }

        (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Result<Option<Index>, InconsistencyHandler::Output> {
        let Some(item) = self.head().first else {
            return Ok(None);
        };
        match self.remove(item) {
            Ok(item) => Ok(Some(item)),
            Err(ItemError::Inconsistent(e)) => Err(e),
            // The first element must be linked
            Err(ItemError::NotLinked) => Err(self.inconsistency_handler.on_inconsistency()),
        }
    }

    /// Get the element following `i`, or `None` if `i` is the last one.
    #[inline]
    pub fn next(&self, i: Index) -> Result<Option<Index>, ItemError<InconsistencyHandler::Output>> {
        let next = (self.map_link)(&self.pool[i])
            .get(&self.cell_key)
            .ok_or(ItemError::NotLinked)?
            .next;
        Ok((Some(&next) != self.head().first.as_ref()).then_some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    type Pool = Vec<(u32, Cell<Option<Link<usize>>>)>;

    fn new_pool(len: u32) -> Pool {
        (0..len).map(|x| (x, Cell::new(None))).collect()
    }

    /// Walk the list with `front` and `next`, checking the back links.
    fn elements(head: &Cell<ListHead<usize>>, pool: &Pool) -> Vec<u32> {
        let accessor = ListAccessorCell::new(head, &pool[..], |(_, link)| link, ());
        let mut out = Vec::new();
        let mut cursor = accessor.front().unwrap();
        while let Some(i) = cursor {
            out.push(pool[i].0);
            cursor = accessor.next(i).unwrap();
            if let Some(next) = cursor {
                assert_eq!(pool[next].1.get().unwrap().prev, i);
            }
        }
        out
    }

    #[test]
    fn insert_at_every_position() {
        let pool = new_pool(4);
        let head = Cell::new(ListHead::INIT);
        let mut accessor = ListAccessorCell::new(&head, &pool[..], |(_, link)| link, ());

        accessor.push_back(0).unwrap();
        accessor.push_back(2).unwrap();
        // Before a non-first element
        accessor.insert(1, Some(2)).unwrap();
        // Before the first element, which moves the head
        accessor.insert(3, Some(0)).unwrap();

        assert_eq!(elements(&head, &pool), [3, 0, 1, 2]);
        assert_eq!(pool[3].1.get().unwrap().prev, 2, "the list is circular");
    }

    #[test]
    fn insert_linked() {
        let pool = new_pool(2);
        let head = Cell::new(ListHead::INIT);
        let mut accessor = ListAccessorCell::new(&head, &pool[..], |(_, link)| link, ());

        accessor.push_back(0).unwrap();
        accessor.push_back(1).unwrap();
        assert!(matches!(
            accessor.insert(0, None),
            Err(InsertError::AlreadyLinked)
        ));
        assert_eq!(elements(&head, &pool), [0, 1]);
    }

    #[test]
    fn remove_first_middle_last() {
        let pool = new_pool(5);
        let head = Cell::new(ListHead::INIT);
        let mut accessor = ListAccessorCell::new(&head, &pool[..], |(_, link)| link, ());
        for i in 0..5 {
            accessor.push_back(i).unwrap();
        }

        assert_eq!(accessor.remove(0).unwrap(), 0);
        assert_eq!(accessor.remove(2).unwrap(), 2);
        assert_eq!(accessor.remove(4).unwrap(), 4);
        assert!(!accessor.is_linked(2));
        assert_eq!(elements(&head, &pool), [1, 3]);

        assert!(matches!(accessor.remove(2), Err(ItemError::NotLinked)));
        assert!(matches!(accessor.next(2), Err(ItemError::NotLinked)));
    }

    #[test]
    fn pop_front_until_empty() {
        let pool = new_pool(3);
        let head = Cell::new(ListHead::INIT);
        let mut accessor = ListAccessorCell::new(&head, &pool[..], |(_, link)| link, ());
        accessor.push_back(2).unwrap();
        accessor.push_back(0).unwrap();
        accessor.push_back(1).unwrap();

        let mut popped = Vec::new();
        while let Some(i) = accessor.pop_front().unwrap() {
            popped.push(i);
        }

        assert_eq!(popped, [2, 0, 1]);
        assert!(head.get().first.is_none());
        assert!(pool.iter().all(|(_, link)| link.get().is_none()));
    }

    #[test]
    fn detects_broken_link() {
        let pool = new_pool(2);
        let head = Cell::new(ListHead::INIT);
        let mut accessor = ListAccessorCell::new(&head, &pool[..], |(_, link)| link, ());
        accessor.push_back(0).unwrap();

        // Point the head at an element that isn't linked
        head.set(ListHead { first: Some(1) });
        assert!(matches!(
            accessor.insert(0, None),
            Err(InsertError::AlreadyLinked)
        ));
        pool[0].1.set(None);
        assert!(matches!(
            accessor.push_back(0),
            Err(InsertError::Inconsistent(InconsistentError))
        ));
        assert_eq!(accessor.pop_front(), Err(InconsistentError));
    }
}
