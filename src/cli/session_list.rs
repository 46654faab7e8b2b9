use std::error::Error;

use crate::core::constants::SESSION_LIST_LIMIT;
use crate::store::SessionStore;

/// Print stored sessions, most recently updated first.
pub async fn list_sessions(store: &SessionStore) -> Result<(), Box<dyn Error>> {
    let sessions = store.list_sessions(SESSION_LIST_LIMIT).await?;

    if sessions.is_empty() {
        println!("No stored sessions yet.");
        return Ok(());
    }

    for session in sessions {
        let title = if session.title.is_empty() {
            "(untitled)"
        } else {
            session.title.as_str()
        };
        println!(
            "  #{:<4} {:<33} {}",
            session.id,
            title,
            session.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
