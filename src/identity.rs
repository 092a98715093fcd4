use chrono::Utc;
use rand::Rng;
use tracing::warn;

const FALLBACK_HOSTNAME: &str = "localhost";

/// Name the server announces itself with: the configured hostname, else the
/// host name of the machine.
pub fn server_identity(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(system_hostname)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

fn system_hostname() -> Option<String> {
    match hostname::get() {
        Ok(name) => match name.into_string() {
            Ok(name) => Some(name),
            Err(name) => {
                warn!(?name, "System host name is not UTF-8, using default");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "Unable to get host name, using default");
            None
        }
    }
}

/// A fresh RFC 2822 style message identifier, `<stamp.pid.random@fqdn>`.
pub fn new_message_id<R: Rng + ?Sized>(fqdn: &str, rng: &mut R) -> String {
    let centis = Utc::now().timestamp_millis() / 10;
    format!(
        "<{}.{}.{}@{}>",
        centis,
        std::process::id(),
        rng.gen::<u64>(),
        fqdn
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_configured_identity_wins() {
        assert_eq!(server_identity(Some("mx.sink.test")), "mx.sink.test");
    }

    #[test]
    fn test_identity_never_empty() {
        assert!(!server_identity(None).is_empty());
        assert_eq!(server_identity(Some("")), FALLBACK_HOSTNAME);
    }

    #[test]
    fn test_machine_hostname_used_without_configuration() {
        match system_hostname().filter(|name| !name.is_empty()) {
            Some(name) => assert_eq!(server_identity(None), name),
            None => assert_eq!(server_identity(None), FALLBACK_HOSTNAME),
        }
    }

    #[test]
    fn test_message_id_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let id = new_message_id("sink.test", &mut rng);
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@sink.test>"));
        assert_eq!(id.matches('.').count(), 3);
    }

    #[test]
    fn test_message_ids_differ() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = new_message_id("sink.test", &mut rng);
        let b = new_message_id("sink.test", &mut rng);
        assert_ne!(a, b);
    }
}
