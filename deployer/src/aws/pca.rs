//! Root Private CA lifecycle via ACM-PCA
//!
//! A fresh CA comes up in PENDING_CERTIFICATE and must be activated by
//! issuing its own root certificate from its CSR and importing it back.

use crate::{aws::resolve, aws::POLL_INTERVAL, error::Error};
use aws_sdk_acmpca::{
    primitives::Blob,
    types::{
        Asn1Subject, CertificateAuthorityConfiguration, CertificateAuthorityStatus,
        CertificateAuthorityType, KeyAlgorithm, SigningAlgorithm, Validity, ValidityPeriodType,
    },
    Client,
};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Template used to self-sign the root certificate
const ROOT_CA_TEMPLATE: &str = "arn:aws:acm-pca:::template/RootCACertificate/V1";

/// Root certificate validity in years
const ROOT_VALIDITY_YEARS: i64 = 10;

/// How long to wait for CA state transitions and certificate issuance
const CA_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Returns the CA status string
async fn ca_status(client: &Client, arn: &str) -> Result<String, Error> {
    let resp = client
        .describe_certificate_authority()
        .certificate_authority_arn(arn)
        .send()
        .await
        .map_err(|e| Error::AwsAcmPca {
            operation: "DescribeCertificateAuthority",
            source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
        })?;
    Ok(resp
        .certificate_authority()
        .and_then(|ca| ca.status())
        .map(|s| s.as_str().to_string())
        .unwrap_or_default())
}

async fn wait_ca_status(client: &Client, arn: &str, expected: &str) -> Result<(), Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > CA_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("certificate authority {arn} to reach {expected}"),
            });
        }
        let status = ca_status(client, arn).await?;
        if status == expected {
            return Ok(());
        }
        debug!(arn, status = status.as_str(), expected, "CA not ready");
    }
}

/// Fetches the CA's CSR, retrying while generation is in progress
async fn ca_csr(client: &Client, arn: &str) -> Result<String, Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > CA_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("CSR of certificate authority {arn}"),
            });
        }
        match client
            .get_certificate_authority_csr()
            .certificate_authority_arn(arn)
            .send()
            .await
        {
            Ok(resp) => {
                if let Some(csr) = resp.csr() {
                    return Ok(csr.to_string());
                }
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if !service_err.is_request_in_progress_exception() {
                    return Err(Error::AwsAcmPca {
                        operation: "GetCertificateAuthorityCsr",
                        source: Box::new(aws_sdk_acmpca::Error::from(service_err)),
                    });
                }
                debug!(arn, "CSR not ready yet");
            }
        }
    }
}

/// Self-signs the root certificate from the CA's CSR and imports it back,
/// moving the CA from PENDING_CERTIFICATE to ACTIVE
async fn activate_ca(client: &Client, arn: &str) -> Result<(), Error> {
    let csr = ca_csr(client, arn).await?;
    let issued = client
        .issue_certificate()
        .certificate_authority_arn(arn)
        .csr(Blob::new(csr.into_bytes()))
        .signing_algorithm(SigningAlgorithm::Sha256Withrsa)
        .template_arn(ROOT_CA_TEMPLATE)
        .validity(
            Validity::builder()
                .value(ROOT_VALIDITY_YEARS)
                .r#type(ValidityPeriodType::Years)
                .build()
                ?,
        )
        .idempotency_token(Uuid::new_v4().simple().to_string())
        .send()
        .await
        .map_err(|e| Error::AwsAcmPca {
            operation: "IssueCertificate",
            source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
        })?;
    let certificate_arn = issued.certificate_arn().ok_or(Error::ResourceNotFound {
        what: "issued root certificate ARN".to_string(),
    })?;

    // The certificate takes a moment to issue
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    let certificate = loop {
        interval.tick().await;
        if start.elapsed() > CA_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("root certificate {certificate_arn}"),
            });
        }
        match client
            .get_certificate()
            .certificate_authority_arn(arn)
            .certificate_arn(certificate_arn)
            .send()
            .await
        {
            Ok(resp) => {
                if let Some(certificate) = resp.certificate() {
                    break certificate.to_string();
                }
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if !service_err.is_request_in_progress_exception() {
                    return Err(Error::AwsAcmPca {
                        operation: "GetCertificate",
                        source: Box::new(aws_sdk_acmpca::Error::from(service_err)),
                    });
                }
                debug!(arn, "root certificate not issued yet");
            }
        }
    };

    client
        .import_certificate_authority_certificate()
        .certificate_authority_arn(arn)
        .certificate(Blob::new(certificate.into_bytes()))
        .send()
        .await
        .map_err(|e| Error::AwsAcmPca {
            operation: "ImportCertificateAuthorityCertificate",
            source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
        })?;
    wait_ca_status(client, arn, "ACTIVE").await?;
    info!(arn, "certificate authority active");
    Ok(())
}

/// Finds or creates the root CA with the given subject, returning its ARN.
/// An existing ACTIVE CA is reused as-is; a half-created one is activated.
pub async fn ensure_root_ca(
    client: &Client,
    common_name: &str,
    organization: &str,
) -> Result<String, Error> {
    if let Some((arn, status)) = resolve::find_certificate_authority(client, common_name).await? {
        match status.as_str() {
            "ACTIVE" => {
                info!(arn = arn.as_str(), "certificate authority already active");
                return Ok(arn);
            }
            "PENDING_CERTIFICATE" => {
                info!(arn = arn.as_str(), "activating existing certificate authority");
                activate_ca(client, &arn).await?;
                return Ok(arn);
            }
            "DISABLED" => {
                info!(arn = arn.as_str(), "re-enabling certificate authority");
                client
                    .update_certificate_authority()
                    .certificate_authority_arn(&arn)
                    .status(CertificateAuthorityStatus::Active)
                    .send()
                    .await
                    .map_err(|e| Error::AwsAcmPca {
                        operation: "UpdateCertificateAuthority",
                        source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
                    })?;
                wait_ca_status(client, &arn, "ACTIVE").await?;
                return Ok(arn);
            }
            "CREATING" => {
                wait_ca_status(client, &arn, "PENDING_CERTIFICATE").await?;
                activate_ca(client, &arn).await?;
                return Ok(arn);
            }
            other => {
                return Err(Error::ResourceNotFound {
                    what: format!("usable certificate authority {common_name} (status {other})"),
                });
            }
        }
    }

    info!(common_name, "creating certificate authority");
    let created = client
        .create_certificate_authority()
        .certificate_authority_configuration(
            CertificateAuthorityConfiguration::builder()
                .key_algorithm(KeyAlgorithm::Rsa2048)
                .signing_algorithm(SigningAlgorithm::Sha256Withrsa)
                .subject(
                    Asn1Subject::builder()
                        .common_name(common_name)
                        .organization(organization)
                        .build(),
                )
                .build()
                ?,
        )
        .certificate_authority_type(CertificateAuthorityType::Root)
        .idempotency_token(Uuid::new_v4().simple().to_string())
        .send()
        .await
        .map_err(|e| Error::AwsAcmPca {
            operation: "CreateCertificateAuthority",
            source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
        })?;
    let arn = created
        .certificate_authority_arn()
        .ok_or(Error::ResourceNotFound {
            what: "created certificate authority ARN".to_string(),
        })?
        .to_string();

    wait_ca_status(client, &arn, "PENDING_CERTIFICATE").await?;
    activate_ca(client, &arn).await?;
    Ok(arn)
}

/// Disables and schedules deletion of the CA; an absent CA is a no-op
pub async fn disable_and_delete_ca(client: &Client, common_name: &str) -> Result<(), Error> {
    let Some((arn, status)) = resolve::find_certificate_authority(client, common_name).await?
    else {
        info!(common_name, "certificate authority does not exist, nothing to delete");
        return Ok(());
    };

    if status == "ACTIVE" {
        client
            .update_certificate_authority()
            .certificate_authority_arn(&arn)
            .status(CertificateAuthorityStatus::Disabled)
            .send()
            .await
            .map_err(|e| Error::AwsAcmPca {
                operation: "UpdateCertificateAuthority",
                source: Box::new(aws_sdk_acmpca::Error::from(e.into_service_error())),
            })?;
        debug!(arn = arn.as_str(), "disabled certificate authority");
    }

    let result = client
        .delete_certificate_authority()
        .certificate_authority_arn(&arn)
        .permanent_deletion_time_in_days(7)
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(arn = arn.as_str(), "certificate authority scheduled for deletion");
            Ok(())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_resource_not_found_exception() {
                info!(arn = arn.as_str(), "certificate authority already gone");
                Ok(())
            } else {
                Err(Error::AwsAcmPca {
                    operation: "DeleteCertificateAuthority",
                    source: Box::new(aws_sdk_acmpca::Error::from(service_err)),
                })
            }
        }
    }
}
