//! S3 wrappers for the templates bucket and artifact uploads

use crate::error::Error;
use aws_sdk_s3::{
    operation::head_object::HeadObjectError,
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
    Client,
};
use tracing::{debug, info};

/// Ensures the bucket exists in the given region, creating it if necessary
pub async fn ensure_bucket_exists(
    client: &Client,
    bucket: &str,
    region: &str,
) -> Result<(), Error> {
    match client.head_bucket().bucket(bucket).send().await {
        Ok(_) => {
            info!(bucket, "bucket already exists");
            return Ok(());
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if !service_err.is_not_found() {
                return Err(Error::AwsS3 {
                    bucket: bucket.to_string(),
                    operation: "HeadBucket",
                    source: Box::new(aws_sdk_s3::Error::from(service_err)),
                });
            }
            debug!(bucket, "bucket not found, will create");
        }
    }

    // us-east-1 must not carry a location constraint
    let mut request = client.create_bucket().bucket(bucket);
    if region != "us-east-1" {
        let constraint = BucketLocationConstraint::from(region);
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(constraint)
                .build(),
        );
    }
    match request.send().await {
        Ok(_) => {
            info!(bucket, region, "created bucket");
            Ok(())
        }
        Err(e) => {
            let service_err = aws_sdk_s3::Error::from(e.into_service_error());
            match &service_err {
                aws_sdk_s3::Error::BucketAlreadyExists(_)
                | aws_sdk_s3::Error::BucketAlreadyOwnedByYou(_) => {
                    info!(bucket, "bucket already exists");
                    Ok(())
                }
                _ => Err(Error::AwsS3 {
                    bucket: bucket.to_string(),
                    operation: "CreateBucket",
                    source: Box::new(service_err),
                }),
            }
        }
    }
}

/// Checks whether an object exists
pub async fn object_exists(client: &Client, bucket: &str, key: &str) -> Result<bool, Error> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let service_err = e.into_service_error();
            if matches!(service_err, HeadObjectError::NotFound(_)) {
                Ok(false)
            } else {
                Err(Error::AwsS3 {
                    bucket: bucket.to_string(),
                    operation: "HeadObject",
                    source: Box::new(aws_sdk_s3::Error::from(service_err)),
                })
            }
        }
    }
}

/// Uploads a document unless an object with the same key is already there.
/// Keys carry a content digest, so an existing object is the same content.
pub async fn upload_if_absent(
    client: &Client,
    bucket: &str,
    key: &str,
    body: Vec<u8>,
) -> Result<(), Error> {
    if object_exists(client, bucket, key).await? {
        debug!(bucket, key, "object already uploaded");
        return Ok(());
    }
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(ByteStream::from(body))
        .send()
        .await
        .map_err(|e| Error::AwsS3 {
            bucket: bucket.to_string(),
            operation: "PutObject",
            source: Box::new(aws_sdk_s3::Error::from(e.into_service_error())),
        })?;
    info!(bucket, key, "uploaded object");
    Ok(())
}

/// Regional HTTPS URL of an object, as CloudFormation expects for
/// `TemplateURL`
pub fn object_url(bucket: &str, region: &str, key: &str) -> String {
    format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_regional_format() {
        assert_eq!(
            object_url("demo-templates", "us-west-2", "templates/abc/network.yaml"),
            "https://demo-templates.s3.us-west-2.amazonaws.com/templates/abc/network.yaml"
        );
    }
}
