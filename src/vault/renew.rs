use crate::{cli::globals::GlobalArgs, vault};
use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Duration as StdDuration;
use tokio::{
    sync::mpsc,
    time::{Duration, sleep},
};
use tracing::{debug, error, instrument, warn};

const RENEW_ATTEMPTS: u32 = 3;

/// Sleep for 70-90% of `lease_seconds` before renewing again.
fn jittered(lease_seconds: u64, rng: &mut StdRng) -> StdDuration {
    let factor = rng.gen_range(70..90);
    Duration::from_secs(lease_seconds * factor / 100)
}

/// Keep the Vault token alive in the background.
///
/// The first renewal happens after a jittered fraction of `lease_duration`.
/// After three failed attempts in a row the task gives up and signals `tx`
/// so the server can shut down instead of serving without key custody.
/// # Errors
/// Returns an error if the renewal task cannot be set up.
#[instrument(skip(globals, tx))]
pub async fn try_renew(
    globals: &GlobalArgs,
    lease_duration: u64,
    tx: mpsc::UnboundedSender<()>,
) -> Result<()> {
    tokio::spawn({
        let mut rng = StdRng::from_entropy();
        let mut next_renewal = jittered(lease_duration, &mut rng);

        let url = globals.vault_url.clone();
        let token = globals.vault_token.clone();

        async move {
            loop {
                debug!("Will renew token in {} seconds", next_renewal.as_secs());

                sleep(next_renewal).await;

                for attempt in 1..=RENEW_ATTEMPTS {
                    let backoff_time = 2u64.pow(attempt - 1);

                    if attempt > 1 {
                        warn!("Backing off for {} seconds", backoff_time);
                        sleep(Duration::from_secs(backoff_time)).await;
                    }

                    match vault::renew_token(&url, &token, None).await {
                        Ok(lease_duration) => {
                            next_renewal = jittered(lease_duration, &mut rng);
                            break;
                        }

                        Err(e) => {
                            error!("Failed to renew token: {}", e);

                            if attempt == RENEW_ATTEMPTS {
                                error!("Failed to renew token after {RENEW_ATTEMPTS} attempts");
                                let _ = tx.send(());
                                return;
                            }
                        }
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_below_the_lease() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let wait = jittered(1000, &mut rng);
            assert!(wait >= Duration::from_secs(700));
            assert!(wait < Duration::from_secs(900));
        }
    }
}
