//! Concrete purge drivers and their construction from settings.

pub mod cloudflare;
pub mod http;

use std::sync::Arc;

use crate::{
    config::{DriverKind, DriverSettings},
    purge::{PurgeDriver, PurgeError},
};

pub use cloudflare::{CloudflareAuth, CloudflareDriver};
pub use http::HttpDriver;

/// Build the configured driver.
///
/// Returns [`PurgeError::NotConfigured`] when no driver is selected, the
/// selected one lacks credentials, or it would have no way to purge everything.
pub fn build_driver(settings: &DriverSettings) -> Result<Arc<dyn PurgeDriver>, PurgeError> {
    match settings.kind {
        None => Err(PurgeError::NotConfigured(
            "no driver selected (set driver.name)".to_string(),
        )),
        Some(DriverKind::Cloudflare) => {
            let cf = &settings.cloudflare;
            let zone_id = cf.zone_id.as_deref().ok_or_else(|| {
                PurgeError::NotConfigured("driver.cloudflare.zone_id is missing".to_string())
            })?;
            let auth = match (&cf.api_token, &cf.email, &cf.api_key) {
                (Some(token), _, _) => CloudflareAuth::Token(token.clone()),
                (None, Some(email), Some(key)) => CloudflareAuth::Key {
                    email: email.clone(),
                    key: key.clone(),
                },
                _ => {
                    return Err(PurgeError::NotConfigured(
                        "driver.cloudflare needs api_token, or email and api_key".to_string(),
                    ));
                }
            };
            let driver = CloudflareDriver::new(&cf.api_base, zone_id, auth, settings.timeout)
                .map_err(|err| PurgeError::NotConfigured(err.to_string()))?;
            Ok(Arc::new(driver))
        }
        Some(DriverKind::Http) => {
            let http = &settings.http;
            let endpoint = http.endpoint.clone().ok_or_else(|| {
                PurgeError::NotConfigured("driver.http.endpoint is missing".to_string())
            })?;
            if http.purge_all_prefixes.iter().all(|prefix| prefix.trim().is_empty()) {
                return Err(PurgeError::NotConfigured(
                    "driver.http.purge_all_prefixes must list at least one prefix".to_string(),
                ));
            }
            let driver = HttpDriver::new(
                endpoint,
                http.token.clone(),
                http.purge_all_prefixes.clone(),
                http.max_urls_per_batch,
                settings.timeout,
            )
            .map_err(|err| PurgeError::NotConfigured(err.to_string()))?;
            Ok(Arc::new(driver))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::config::{CloudflareSettings, HttpDriverSettings};

    fn settings(kind: Option<DriverKind>) -> DriverSettings {
        DriverSettings {
            kind,
            timeout: Duration::from_secs(5),
            cloudflare: CloudflareSettings {
                api_base: Url::parse(cloudflare::DEFAULT_API_BASE).unwrap(),
                zone_id: None,
                api_token: None,
                email: None,
                api_key: None,
            },
            http: HttpDriverSettings {
                endpoint: None,
                token: None,
                purge_all_prefixes: Vec::new(),
                max_urls_per_batch: None,
            },
        }
    }

    #[test]
    fn missing_driver_is_not_configured() {
        let err = build_driver(&settings(None)).err().unwrap();
        assert!(matches!(err, PurgeError::NotConfigured(_)));
    }

    #[test]
    fn cloudflare_requires_zone_and_credentials() {
        let mut config = settings(Some(DriverKind::Cloudflare));
        assert!(matches!(
            build_driver(&config).err().unwrap(),
            PurgeError::NotConfigured(_)
        ));

        config.cloudflare.zone_id = Some("zone".to_string());
        config.cloudflare.email = Some("ops@example.com".to_string());
        assert!(matches!(
            build_driver(&config).err().unwrap(),
            PurgeError::NotConfigured(_)
        ));

        config.cloudflare.api_key = Some("key".to_string());
        let driver = build_driver(&config).unwrap();
        assert_eq!(driver.descriptor().name, "cloudflare");
        assert_eq!(driver.max_urls_per_batch(), 30);
    }

    #[test]
    fn http_driver_requires_purge_all_prefixes() {
        let mut config = settings(Some(DriverKind::Http));
        config.http.endpoint = Some(Url::parse("https://purge.example/hook").unwrap());
        assert!(matches!(
            build_driver(&config).err().unwrap(),
            PurgeError::NotConfigured(reason) if reason.contains("purge_all_prefixes")
        ));

        config.http.purge_all_prefixes = vec!["  ".to_string()];
        assert!(matches!(
            build_driver(&config).err().unwrap(),
            PurgeError::NotConfigured(_)
        ));
    }

    #[test]
    fn http_driver_carries_prefixes() {
        let mut config = settings(Some(DriverKind::Http));
        config.http.endpoint = Some(Url::parse("https://purge.example/hook").unwrap());
        config.http.purge_all_prefixes = vec!["https://blog.example.com/".to_string()];

        let driver = build_driver(&config).unwrap();
        assert_eq!(driver.descriptor().name, "http");
        assert_eq!(driver.max_urls_per_batch(), 500);
        assert_eq!(
            driver.descriptor().purge_all_prefixes,
            vec!["https://blog.example.com/".to_string()]
        );
    }
}
