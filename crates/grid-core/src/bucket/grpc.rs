use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::instrument;

use super::{AllocateResult, BucketWriter, Error, ServerVersion, StorageServer};
use crate::digests::StorageIndex;
use crate::proto;

/// Connects to a storage server over gRPC.
#[derive(Clone)]
pub struct GrpcStorageServer {
    server_id: Vec<u8>,
    client: proto::storage_server_client::StorageServerClient<Channel>,
}

impl GrpcStorageServer {
    pub fn from_client(
        server_id: Vec<u8>,
        client: proto::storage_server_client::StorageServerClient<Channel>,
    ) -> Self {
        Self { server_id, client }
    }
}

#[async_trait]
impl StorageServer for GrpcStorageServer {
    fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    #[instrument(skip_all, fields(server.id = ?self.server_id), err)]
    async fn get_version(&self) -> Result<ServerVersion, Error> {
        let resp = self
            .client
            .clone()
            .get_version(proto::GetVersionRequest {})
            .await
            .map_err(Error::from)?
            .into_inner();
        Ok(ServerVersion {
            max_immutable_share_size: resp.max_immutable_share_size,
            application_version: resp.application_version,
        })
    }

    #[instrument(skip_all, fields(server.id = ?self.server_id, storage_index = ?storage_index), err)]
    async fn get_buckets(&self, storage_index: &StorageIndex) -> Result<Vec<u16>, Error> {
        let resp = self
            .client
            .clone()
            .get_buckets(proto::GetBucketsRequest {
                storage_index: storage_index.as_bytes().to_vec().into(),
            })
            .await
            .map_err(Error::from)?
            .into_inner();
        to_u16_vec(resp.share_numbers)
    }

    #[instrument(skip_all, fields(server.id = ?self.server_id, storage_index = ?storage_index, n = share_numbers.len()), err)]
    async fn allocate_buckets(
        &self,
        storage_index: &StorageIndex,
        renew_secret: &[u8; 32],
        cancel_secret: &[u8; 32],
        share_numbers: &[u16],
        allocated_size: u64,
    ) -> Result<AllocateResult, Error> {
        let resp = self
            .client
            .clone()
            .allocate_buckets(proto::AllocateBucketsRequest {
                storage_index: storage_index.as_bytes().to_vec().into(),
                renew_secret: renew_secret.to_vec().into(),
                cancel_secret: cancel_secret.to_vec().into(),
                share_numbers: share_numbers.iter().map(|&n| n as u32).collect(),
                allocated_size,
            })
            .await
            .map_err(Error::from)?
            .into_inner();

        let already_have = to_u16_vec(resp.already_have)?;
        let accepted = to_u16_vec(resp.accepted)?;

        let writers = accepted
            .into_iter()
            .map(|share_number| {
                let writer: Box<dyn BucketWriter> = Box::new(GrpcBucketWriter {
                    client: self.client.clone(),
                    storage_index: *storage_index,
                    share_number,
                    write_offset: 0,
                });
                (share_number, writer)
            })
            .collect();

        Ok(AllocateResult {
            already_have,
            writers,
        })
    }

    #[instrument(skip_all, fields(server.id = ?self.server_id, storage_index = ?storage_index, share_number), err)]
    async fn abort_bucket(&self, storage_index: &StorageIndex, share_number: u16) -> Result<(), Error> {
        self.client
            .clone()
            .abort_bucket(proto::AbortBucketRequest {
                storage_index: storage_index.as_bytes().to_vec().into(),
                share_number: share_number as u32,
            })
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

fn to_u16_vec(values: Vec<u32>) -> Result<Vec<u16>, Error> {
    values
        .into_iter()
        .map(|v| {
            u16::try_from(v)
                .map_err(|_| Error::ProtocolViolation(format!("share number {v} out of range")))
        })
        .collect()
}

struct GrpcBucketWriter {
    client: proto::storage_server_client::StorageServerClient<Channel>,
    storage_index: StorageIndex,
    share_number: u16,
    write_offset: u64,
}

#[async_trait]
impl BucketWriter for GrpcBucketWriter {
    async fn put_block(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.client
            .write_block(proto::WriteBlockRequest {
                storage_index: self.storage_index.as_bytes().to_vec().into(),
                share_number: self.share_number as u32,
                offset,
                data: data.to_vec().into(),
            })
            .await
            .map_err(Error::from)?;
        self.write_offset = offset + data.len() as u64;
        Ok(())
    }

    async fn put_crypttext_hashes(&mut self, data: &[u8]) -> Result<(), Error> {
        let offset = self.write_offset;
        self.put_block(offset, data).await
    }

    async fn put_block_hashes(&mut self, data: &[u8]) -> Result<(), Error> {
        let offset = self.write_offset;
        self.put_block(offset, data).await
    }

    async fn put_share_hashes(&mut self, data: &[u8]) -> Result<(), Error> {
        let offset = self.write_offset;
        self.put_block(offset, data).await
    }

    async fn put_uri_extension(&mut self, data: &[u8]) -> Result<(), Error> {
        let offset = self.write_offset;
        self.put_block(offset, data).await
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.client
            .clone()
            .close_bucket(proto::CloseBucketRequest {
                storage_index: self.storage_index.as_bytes().to_vec().into(),
                share_number: self.share_number as u32,
            })
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), Error> {
        self.client
            .clone()
            .abort_bucket(proto::AbortBucketRequest {
                storage_index: self.storage_index.as_bytes().to_vec().into(),
                share_number: self.share_number as u32,
            })
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}
