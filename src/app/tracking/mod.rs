mod api;
mod history;
mod sync;

pub(crate) use api::*;
pub(crate) use history::*;
pub(crate) use sync::*;

#[cfg(test)]
pub(crate) use sync::fake::FakeTracker;
