//! Payload aggregation: selected event bodies joined into prompt context.
//!
//! Unknown ids are skipped rather than failing the request, so a large
//! selection is not spoiled by one stale id.

use std::collections::BTreeSet;

use tracing::debug;

use hookscribe_common::event::EventId;
use hookscribe_common::store::{EventStore, StoreError};

use crate::error::ValidationError;

/// Separator placed between consecutive bodies.
pub const SEPARATOR: &str = "\n\n";

/// Most ids accepted in one generation request.
pub const MAX_SELECTION: usize = 1000;

/// Validated, de-duplicated, non-empty set of event ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSelection(Vec<EventId>);

impl EventSelection {
    pub fn parse(raw: &[String]) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::new("eventIds must not be empty"));
        }

        let ids = raw
            .iter()
            .map(|s| {
                s.parse::<EventId>()
                    .map_err(|e| ValidationError::new(e.to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        if ids.len() > MAX_SELECTION {
            return Err(ValidationError::new(format!(
                "at most {MAX_SELECTION} eventIds per request, got {}",
                ids.len()
            )));
        }
        Ok(EventSelection(ids.into_iter().collect()))
    }

    pub fn ids(&self) -> &[EventId] {
        &self.0
    }
}

/// Concatenated bodies of the resolved events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub text: String,
    pub requested: usize,
    pub resolved: usize,
}

pub fn aggregate(store: &EventStore, selection: &EventSelection) -> Result<Aggregate, StoreError> {
    let bodies = store.bodies_for(selection.ids())?;

    if bodies.len() < selection.ids().len() {
        debug!(
            "Aggregating {} of {} selected events; the rest were not found",
            bodies.len(),
            selection.ids().len()
        );
    }

    Ok(Aggregate {
        requested: selection.ids().len(),
        resolved: bodies.len(),
        text: bodies.join(SEPARATOR),
    })
}
