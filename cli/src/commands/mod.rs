mod helpers;
mod intake;
mod settings;
mod summary;
mod sync;

pub(crate) use intake::{cmd_list, cmd_log, cmd_remove};
pub(crate) use settings::{cmd_settings_reset, cmd_settings_set, cmd_settings_show};
pub(crate) use summary::{cmd_history, cmd_status, cmd_timeline};
pub(crate) use sync::{cmd_sync, cmd_sync_logout, cmd_sync_status};
