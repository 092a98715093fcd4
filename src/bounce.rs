/// A canned rejection used to simulate a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounce {
    pub code: u16,
    pub reason: &'static str,
}

/// Every rejection the sink can answer a finished DATA with.
pub const BOUNCES: [Bounce; 10] = [
    Bounce { code: 450, reason: "Requested mail action not taken: mailbox unavailable" },
    Bounce { code: 451, reason: "Requested action aborted: local error in processing" },
    Bounce { code: 452, reason: "Requested action not taken: insufficient system storage" },
    Bounce { code: 458, reason: "Unable to queue message" },
    Bounce { code: 521, reason: "Machine does not accept mail" },
    Bounce { code: 550, reason: "Requested action not taken: mailbox unavailable" },
    Bounce { code: 551, reason: "User not local" },
    Bounce { code: 552, reason: "Requested mail action aborted: exceeded storage allocation" },
    Bounce { code: 553, reason: "Requested action not taken: mailbox name not allowed" },
    Bounce { code: 571, reason: "Blocked" },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique_and_in_range() {
        let codes: HashSet<u16> = BOUNCES.iter().map(|b| b.code).collect();
        assert_eq!(codes.len(), BOUNCES.len());
        assert!(BOUNCES.iter().all(|b| (450..600).contains(&b.code)));
    }

    #[test]
    fn test_reasons_are_not_empty() {
        assert!(BOUNCES.iter().all(|b| !b.reason.is_empty()));
        assert_eq!(BOUNCES[9], Bounce { code: 571, reason: "Blocked" });
    }
}
