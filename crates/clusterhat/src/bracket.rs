//! Scoped enabling of a board auxiliary.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{info, warn};

use crate::board::{Auxiliary, BoardController, BoardError, Switch};

/// Run `body` with `aux` switched on, switching it off afterwards.
///
/// The auxiliary is switched off on every exit path of `body`: normal
/// completion, an `Err` value, an early return through `?` inside the body,
/// or a panic (which is resumed after the switch-off). A failure to switch
/// it off is logged and does not affect the value returned from `body`.
///
/// # Errors
/// Returns the [`BoardError`] if the auxiliary cannot be switched on. `body`
/// is not run and no switch-off is attempted in that case.
pub async fn with_auxiliary_enabled<F, T>(
    board: &dyn BoardController,
    aux: Auxiliary,
    body: F,
) -> Result<T, BoardError>
where
    F: Future<Output = T>,
{
    board.set_auxiliary(aux, Switch::On).await?;
    info!(auxiliary = %aux, "Auxiliary engaged");

    let outcome = AssertUnwindSafe(body).catch_unwind().await;

    match board.set_auxiliary(aux, Switch::Off).await {
        Ok(_) => info!(auxiliary = %aux, "Auxiliary released"),
        Err(e) => warn!(auxiliary = %aux, error = %e, "Failed to release auxiliary"),
    }

    match outcome {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
