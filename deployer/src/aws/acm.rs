//! Private certificates issued from the platform CA via ACM

use crate::{aws::resolve, aws::POLL_INTERVAL, error::Error};
use aws_sdk_acm::{primitives::Blob, Client};
use std::time::Duration;
use tracing::{debug, info};

/// How long to wait for a certificate to be issued
const ISSUE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Material returned by an export: PEM certificate, chain, and the
/// passphrase-encrypted private key
pub struct ExportedCertificate {
    pub certificate: String,
    pub certificate_chain: String,
    pub private_key: String,
}

/// Requests a private certificate for the domain from the CA unless one
/// already exists, and waits until it is issued. Returns the ARN.
pub async fn ensure_private_certificate(
    client: &Client,
    domain: &str,
    ca_arn: &str,
) -> Result<String, Error> {
    if let Some(arn) = resolve::find_certificate_by_domain(client, domain).await? {
        info!(domain, arn = arn.as_str(), "certificate already exists");
        wait_issued(client, &arn).await?;
        return Ok(arn);
    }

    info!(domain, "requesting certificate");
    let resp = client
        .request_certificate()
        .domain_name(domain)
        .certificate_authority_arn(ca_arn)
        .send()
        .await
        .map_err(|e| Error::AwsAcm {
            operation: "RequestCertificate",
            source: Box::new(aws_sdk_acm::Error::from(e.into_service_error())),
        })?;
    let arn = resp
        .certificate_arn()
        .ok_or(Error::ResourceNotFound {
            what: format!("requested certificate ARN for {domain}"),
        })?
        .to_string();
    wait_issued(client, &arn).await?;
    info!(domain, arn = arn.as_str(), "certificate issued");
    Ok(arn)
}

/// Polls until the certificate reaches ISSUED
pub async fn wait_issued(client: &Client, arn: &str) -> Result<(), Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > ISSUE_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("certificate {arn} to be issued"),
            });
        }
        let resp = client
            .describe_certificate()
            .certificate_arn(arn)
            .send()
            .await
            .map_err(|e| Error::AwsAcm {
                operation: "DescribeCertificate",
                source: Box::new(aws_sdk_acm::Error::from(e.into_service_error())),
            })?;
        let status = resp
            .certificate()
            .and_then(|c| c.status())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        match status.as_str() {
            "ISSUED" => return Ok(()),
            "PENDING_VALIDATION" | "" => {
                debug!(arn, "certificate not issued yet");
            }
            other => {
                return Err(Error::ResourceNotFound {
                    what: format!("issued certificate {arn} (status {other})"),
                });
            }
        }
    }
}

/// Exports a private certificate with its key, encrypted under the
/// given passphrase
pub async fn export_certificate(
    client: &Client,
    arn: &str,
    passphrase: &str,
) -> Result<ExportedCertificate, Error> {
    let resp = client
        .export_certificate()
        .certificate_arn(arn)
        .passphrase(Blob::new(passphrase.as_bytes().to_vec()))
        .send()
        .await
        .map_err(|e| Error::AwsAcm {
            operation: "ExportCertificate",
            source: Box::new(aws_sdk_acm::Error::from(e.into_service_error())),
        })?;
    Ok(ExportedCertificate {
        certificate: resp.certificate().unwrap_or_default().to_string(),
        certificate_chain: resp.certificate_chain().unwrap_or_default().to_string(),
        private_key: resp.private_key().unwrap_or_default().to_string(),
    })
}

/// Deletes the certificate for a domain; an absent certificate is a no-op
pub async fn delete_certificate_if_exists(client: &Client, domain: &str) -> Result<(), Error> {
    let Some(arn) = resolve::find_certificate_by_domain(client, domain).await? else {
        info!(domain, "certificate does not exist, nothing to delete");
        return Ok(());
    };
    let result = client.delete_certificate().certificate_arn(&arn).send().await;
    match result {
        Ok(_) => {
            info!(domain, arn = arn.as_str(), "deleted certificate");
            Ok(())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_resource_not_found_exception() {
                info!(domain, "certificate already gone");
                Ok(())
            } else {
                Err(Error::AwsAcm {
                    operation: "DeleteCertificate",
                    source: Box::new(aws_sdk_acm::Error::from(service_err)),
                })
            }
        }
    }
}
