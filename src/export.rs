//! Maildir export (spec §6 CLI surface): dumps a folder's cached raw
//! messages into a standard Maildir tree via the `maildir` crate, the same
//! one the retrieval pack's `comunicado` manifest pulls in for Maildir
//! interop.

use crate::cache::Cache;
use crate::errors::{AppError, AppResult};
use crate::types::{Flags, Folder};
use maildir::Maildir;
use std::path::Path;

fn maildir_flags(flags: Flags) -> String {
    // Maildir info flags are a sorted subset of "DFPRST"; wrenmail only
    // ever sets the four the cache tracks.
    let mut out = String::new();
    if flags.contains(Flags::DRAFT) {
        out.push('D');
    }
    if flags.contains(Flags::FLAGGED) {
        out.push('F');
    }
    if flags.contains(Flags::ANSWERED) {
        out.push('R');
    }
    if flags.contains(Flags::SEEN) {
        out.push('S');
    }
    out
}

pub async fn export_folder(cache: &Cache, folder: &Folder, destination: &Path) -> AppResult<usize> {
    let maildir = Maildir::from(destination.to_path_buf());
    maildir
        .create_dirs()
        .map_err(|e| AppError::Unexpected(format!("creating maildir at {}: {e}", destination.display())))?;

    let Some(uids) = cache.get_uids(folder).await else {
        return Ok(0);
    };

    let mut exported = 0;
    for uid in uids {
        let Some(body) = cache.get_body(folder, uid).await else {
            continue;
        };
        let flags = cache.get_flags(folder, uid).await.unwrap_or_default();
        maildir
            .store_cur_with_flags(&body.raw, &maildir_flags(flags))
            .map_err(|e| AppError::Unexpected(format!("writing uid {uid}: {e}")))?;
        exported += 1;
    }
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maildir_flags_orders_dfrs() {
        let flags = Flags::SEEN | Flags::FLAGGED;
        assert_eq!(maildir_flags(flags), "FS");
    }

    #[test]
    fn maildir_flags_empty_for_no_flags() {
        assert_eq!(maildir_flags(Flags::empty()), "");
    }
}
