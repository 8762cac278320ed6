//! Conforming query results to a unit of work's uncommitted state.
//!
//! The database only knows committed rows. A conforming read inside a unit
//! of work corrects its answer with what the unit already did in memory:
//!
//! - a row whose object is registered is answered with the registered clone,
//!   and dropped if that clone is deleted or no longer matches;
//! - registered objects the database did not return (new objects, or stored
//!   objects edited into matching) are added when they match.
//!
//! Every object appears at most once.

use std::collections::HashSet;

use relmap_core::{Descriptor, IdentityKey, ObjectState, Result};
use relmap_query::Expr;

/// A registered object of the queried entity, as it stood before the query.
#[derive(Debug)]
pub(crate) struct Registered {
    pub index: usize,
    pub key: Option<IdentityKey>,
    pub deleted: bool,
    pub state: ObjectState,
}

/// One row returned by the database.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DatabaseHit {
    /// The row's object was registered before the query; position in the
    /// `registered` slice.
    Known(usize),
    /// The row's object was registered by this query; registration index.
    Fresh(usize),
}

/// Tally of a conforming read, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConformStats {
    pub substituted: usize,
    pub dropped: usize,
    pub added: usize,
}

fn matches(descriptor: &Descriptor, criteria: Option<&Expr>, state: &ObjectState) -> Result<bool> {
    match criteria {
        Some(expr) => Ok(expr.evaluate(descriptor, state)?.is_true()),
        None => Ok(true),
    }
}

/// Registration indexes of the conformed result, database order first.
pub(crate) fn conform(
    descriptor: &Descriptor,
    criteria: Option<&Expr>,
    database: &[DatabaseHit],
    registered: &[Registered],
) -> Result<(Vec<usize>, ConformStats)> {
    let mut result = Vec::new();
    let mut seen = HashSet::new();
    let mut seen_keys = HashSet::new();
    let mut stats = ConformStats::default();

    for hit in database {
        match *hit {
            DatabaseHit::Fresh(index) => {
                if seen.insert(index) {
                    result.push(index);
                }
            }
            DatabaseHit::Known(position) => {
                let entry = &registered[position];
                if !seen.insert(entry.index) {
                    continue;
                }
                if let Some(key) = &entry.key {
                    seen_keys.insert(key.clone());
                }
                if !entry.deleted && matches(descriptor, criteria, &entry.state)? {
                    stats.substituted += 1;
                    result.push(entry.index);
                } else {
                    stats.dropped += 1;
                }
            }
        }
    }

    for entry in registered {
        if entry.deleted || seen.contains(&entry.index) {
            continue;
        }
        if entry.key.as_ref().is_some_and(|k| seen_keys.contains(k)) {
            continue;
        }
        if matches(descriptor, criteria, &entry.state)? {
            seen.insert(entry.index);
            if let Some(key) = &entry.key {
                seen_keys.insert(key.clone());
            }
            stats.added += 1;
            result.push(entry.index);
        }
    }

    Ok((result, stats))
}
