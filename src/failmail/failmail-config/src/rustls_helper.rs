/*
 * Failmail SMTP buffering relay
 * Copyright (C) 2022 the Failmail developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/
use anyhow::Context;

/// Build the STARTTLS server configuration from the receiver's PEM files,
/// when both are configured.
///
/// # Errors
///
/// * a file cannot be read
/// * no certificate or no supported private key in the PEM data
/// * the certificate/key pair is rejected
pub fn get_rustls_config(
    config: &crate::Config,
) -> anyhow::Result<Option<rustls::ServerConfig>> {
    let (Some(cert_path), Some(key_path)) = (
        &config.receiver.tls_certificate,
        &config.receiver.tls_private_key,
    ) else {
        return Ok(None);
    };

    let certs = read_certificates(cert_path)?;
    anyhow::ensure!(
        !certs.is_empty(),
        "no certificate found in `{}`",
        cert_path.display()
    );
    let key = read_private_key(key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("cannot initialize tls config")?;

    Ok(Some(tls_config))
}

fn read_certificates(path: &std::path::Path) -> anyhow::Result<Vec<rustls::Certificate>> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path)
            .with_context(|| format!("cannot read certificate `{}`", path.display()))?,
    );
    Ok(rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect())
}

fn read_private_key(path: &std::path::Path) -> anyhow::Result<rustls::PrivateKey> {
    let raw = std::fs::read(path)
        .with_context(|| format!("cannot read private key `{}`", path.display()))?;

    for parser in [rustls_pemfile::pkcs8_private_keys, rustls_pemfile::rsa_private_keys] {
        let mut reader = std::io::BufReader::new(raw.as_slice());
        if let Some(key) = parser(&mut reader)?.into_iter().next() {
            return Ok(rustls::PrivateKey(key));
        }
    }
    anyhow::bail!("no supported private key in `{}`", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_both_files() {
        let mut config = crate::Config::default();
        assert!(get_rustls_config(&config).unwrap().is_none());

        // one file alone leaves TLS off, as the original did
        config.receiver.tls_certificate = Some("cert.pem".into());
        assert!(get_rustls_config(&config).unwrap().is_none());
    }

    #[test]
    fn missing_files_are_an_error() {
        let mut config = crate::Config::default();
        config.receiver.tls_certificate = Some("/nonexistent/cert.pem".into());
        config.receiver.tls_private_key = Some("/nonexistent/key.pem".into());
        assert!(get_rustls_config(&config).is_err());
    }
}
