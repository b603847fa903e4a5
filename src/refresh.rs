//! Manual refresh of a single materialized view
//!
//! Automatic refreshes run inside the generated trigger functions; this is
//! the entry point for views registered with `refresh_automatically = false`
//! and for ad-hoc refreshes of any materialized view.

use crate::dependency::triggers::refresh_statement;
use crate::error::{ViewGraphError, ViewGraphResult};
use crate::registry::ViewRegistry;
use crate::session::{run, NoticeLevel, Session};

/// Refresh the materialized view registered under `name`.
///
/// `concurrently` defaults to whether the view declares a unique column
/// group, since PostgreSQL only refreshes concurrently with a unique index.
///
/// # Errors
/// `UnknownView` when nothing is registered under `name`, `NotMaterialized`
/// for plain views, `StatementFailed` when the refresh itself fails.
pub fn refresh_view<S: Session + ?Sized>(
    session: &mut S,
    registry: &ViewRegistry,
    name: &str,
    concurrently: Option<bool>,
) -> ViewGraphResult<String> {
    let definition = registry.get(name).ok_or_else(|| ViewGraphError::UnknownView {
        name: name.to_string(),
    })?;

    if !definition.is_materialized() {
        return Err(ViewGraphError::NotMaterialized {
            name: name.to_string(),
        });
    }

    let concurrently = concurrently.unwrap_or_else(|| definition.refreshes_concurrently());
    let sql = refresh_statement(&definition.name, concurrently);
    run(session, &sql)?;
    session.notice(NoticeLevel::Info, &format!("Refreshed {}", definition.name));

    Ok(sql)
}
