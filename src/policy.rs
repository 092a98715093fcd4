//! Decides how a finished DATA transaction is answered.

use crate::bounce::{Bounce, BOUNCES};
use crate::config::Mode;
use crate::reply::Reply;

use rand::Rng;

pub fn queued(message_id: &str) -> Reply {
    Reply::new(250, format!("2.0.0 OK: queued as {}", message_id))
}

fn bounced(bounce: &Bounce) -> Reply {
    Reply::new(bounce.code, bounce.reason)
}

/// The reply ending a DATA transaction under `mode`.
///
/// `Random` draws uniformly from the success reply and the ten bounces, so
/// each of the eleven outcomes has the same weight.
pub fn completion_response<R: Rng + ?Sized>(mode: Mode, message_id: &str, rng: &mut R) -> Reply {
    match mode {
        Mode::Accept => queued(message_id),
        Mode::Bounce => bounced(&BOUNCES[rng.gen_range(0..BOUNCES.len())]),
        Mode::Random => {
            let pick = rng.gen_range(0..=BOUNCES.len());
            match BOUNCES.get(pick) {
                Some(bounce) => bounced(bounce),
                None => queued(message_id),
            }
        }
    }
}
