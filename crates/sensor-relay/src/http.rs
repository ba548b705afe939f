// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

use reqwest::ClientBuilder;
#[cfg(feature = "fips")]
use tracing::debug;

/// Builds the HTTP client used to reach the ingestion endpoint, with an
/// optional HTTPS proxy. Request timeouts are applied per request.
pub fn build_client(proxy_url: Option<&str>) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = create_client_builder()?;
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

#[cfg(not(feature = "fips"))]
fn create_client_builder() -> Result<ClientBuilder, Box<dyn Error>> {
    Ok(reqwest::Client::builder().use_rustls_tls())
}

/// FIPS builds require a FIPS crypto provider to have been installed as the
/// process default before the client is created.
#[cfg(feature = "fips")]
fn create_client_builder() -> Result<ClientBuilder, Box<dyn Error>> {
    let provider =
        rustls::crypto::CryptoProvider::get_default().ok_or("No crypto provider configured")?;
    if !provider.fips() {
        return Err("Crypto provider is not FIPS-compliant".into());
    }

    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("Loaded {added} native root certificates, ignored {ignored}");
    if added == 0 {
        return Err("No valid certificates found in native root store".into());
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|_| "Failed to set protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !config.fips() {
        return Err("The final TLS configuration is not FIPS-compliant".into());
    }

    Ok(reqwest::Client::builder().use_preconfigured_tls(config))
}
