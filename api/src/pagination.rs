//! Cursor-based pagination over the event store.
//!
//! A page of `n` is served by reading `n + 1` rows below the cursor.  The
//! extra row only signals that more data exists; it is dropped and the id
//! of the last kept row becomes the next cursor.  Ids never change and rows
//! are never deleted, so a cursor stays valid indefinitely.

use hookscribe_common::event::{EventId, EventSummary};
use hookscribe_common::store::{EventStore, StoreError};

use crate::error::ValidationError;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Page size within `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(usize);

impl PageSize {
    pub fn new(size: usize) -> Result<Self, ValidationError> {
        if (1..=MAX_PAGE_SIZE).contains(&size) {
            Ok(PageSize(size))
        } else {
            Err(ValidationError::new(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}, got {size}"
            )))
        }
    }

    /// Parse the `limit` query parameter; absent means the default.
    pub fn parse(raw: Option<&str>) -> Result<Self, ValidationError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(PageSize::default()),
            Some(text) => {
                let size = text
                    .parse::<usize>()
                    .map_err(|_| ValidationError::new(format!("limit is not a number: {text:?}")))?;
                PageSize::new(size)
            }
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        PageSize(DEFAULT_PAGE_SIZE)
    }
}

/// Parse the `cursor` query parameter; absent or empty means "newest".
pub fn parse_cursor(raw: Option<&str>) -> Result<Option<EventId>, ValidationError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|e| ValidationError::new(format!("malformed cursor: {e}"))),
    }
}

/// One page of summaries, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<EventSummary>,
    pub next_cursor: Option<EventId>,
}

pub fn paginate(
    store: &EventStore,
    cursor: Option<&EventId>,
    size: PageSize,
) -> Result<Page, StoreError> {
    let n = size.get();
    let mut items = store.range_before(cursor, n + 1)?;

    let next_cursor = if items.len() > n {
        items.truncate(n);
        items.last().map(|s| s.id)
    } else {
        None
    };

    Ok(Page { items, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookscribe_common::event::NewEvent;

    fn temp_store() -> EventStore {
        let dir = std::env::temp_dir().join(format!("hookscribe_page_{}", uuid::Uuid::new_v4()));
        EventStore::open(&dir.join("webhooks.db")).unwrap()
    }

    fn fill(store: &EventStore, n: usize) -> Vec<EventId> {
        (0..n)
            .map(|i| {
                store
                    .insert(NewEvent::new("POST", "/hook", format!("{{\"n\":{i}}}")))
                    .unwrap()
                    .id
            })
            .collect()
    }

    fn walk(store: &EventStore, size: PageSize) -> (Vec<EventId>, usize) {
        let mut seen = Vec::new();
        let mut cursor = None;
        let mut pages = 0;
        loop {
            let page = paginate(store, cursor.as_ref(), size).unwrap();
            pages += 1;
            assert!(page.items.len() <= size.get());
            seen.extend(page.items.iter().map(|s| s.id));
            match page.next_cursor {
                Some(next) => {
                    assert_eq!(Some(next), page.items.last().map(|s| s.id));
                    cursor = Some(next);
                }
                None => break,
            }
            assert!(pages <= 100, "pagination did not terminate");
        }
        (seen, pages)
    }

    #[test]
    fn test_every_record_exactly_once_in_descending_order() {
        let store = temp_store();
        let mut ids = fill(&store, 7);
        ids.reverse();

        for k in 1..=8 {
            let (seen, _) = walk(&store, PageSize::new(k).unwrap());
            assert_eq!(seen, ids, "page size {k}");
        }
    }

    #[test]
    fn test_limit_one_terminates() {
        let store = temp_store();
        fill(&store, 3);
        let (seen, pages) = walk(&store, PageSize::new(1).unwrap());
        assert_eq!(seen.len(), 3);
        assert_eq!(pages, 3);
    }

    #[test]
    fn test_same_cursor_same_page() {
        let store = temp_store();
        let ids = fill(&store, 5);
        let size = PageSize::new(2).unwrap();

        let first = paginate(&store, Some(&ids[4]), size).unwrap();
        let second = paginate(&store, Some(&ids[4]), size).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.next_cursor, Some(ids[2]));
    }

    #[test]
    fn test_exact_fit_has_no_cursor() {
        let store = temp_store();
        fill(&store, 2);
        let page = paginate(&store, None, PageSize::new(2).unwrap()).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_empty_store() {
        let store = temp_store();
        let page = paginate(&store, None, PageSize::default()).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_page_size_bounds() {
        assert_eq!(PageSize::parse(None).unwrap().get(), DEFAULT_PAGE_SIZE);
        assert_eq!(PageSize::parse(Some("100")).unwrap().get(), 100);
        assert!(PageSize::parse(Some("0")).is_err());
        assert!(PageSize::parse(Some("101")).is_err());
        assert!(PageSize::parse(Some("-3")).is_err());
        assert!(PageSize::parse(Some("ten")).is_err());
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor(None).unwrap(), None);
        assert_eq!(parse_cursor(Some("")).unwrap(), None);
        assert!(parse_cursor(Some("webhook_123")).is_err());
        let id = hookscribe_common::event::IdGenerator::new().next_id();
        assert_eq!(parse_cursor(Some(&id.to_string())).unwrap(), Some(id));
    }
}
