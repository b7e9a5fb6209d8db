use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use devopin_proto::MonitoringPayload;
use log::{debug, warn};
use tokio::{fs, io::AsyncWriteExt};

/// Durable queue of payloads the backend has not accepted yet.
///
/// The file is a sequence of `[u32 little-endian length][postcard payload]`
/// records, oldest first.
#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
    max_records: usize,
}

fn encode_record(payload: &MonitoringPayload) -> io::Result<Bytes> {
    let encoded = postcard::to_allocvec(payload).map_err(io::Error::other)?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| io::Error::other("payload too large for the spool"))?;
    let mut record = BytesMut::with_capacity(4 + encoded.len());
    record.put_u32_le(len);
    record.put_slice(&encoded);
    Ok(record.freeze())
}

/// Splits the spool file into framed records; the flag is false when a torn
/// tail was found.
fn split_records(mut data: Bytes) -> (Vec<Bytes>, bool) {
    let mut records = Vec::new();
    while data.remaining() >= 4 {
        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 < len {
            warn!("dropping truncated spool record ({} of {len} bytes)", data.len() - 4);
            return (records, false);
        }
        records.push(data.split_to(4 + len));
    }
    let clean = !data.has_remaining();
    (records, clean)
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>, max_records: usize) -> Self {
        Spool {
            path: path.into(),
            max_records: max_records.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> io::Result<(Vec<Bytes>, bool)> {
        match fs::read(&self.path).await {
            Ok(data) => Ok(split_records(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((Vec::new(), true)),
            Err(e) => Err(e),
        }
    }

    async fn read_records(&self) -> io::Result<Vec<Bytes>> {
        Ok(self.read_file().await?.0)
    }

    async fn write_records(&self, records: &[Bytes]) -> io::Result<()> {
        if records.is_empty() {
            return match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).await?;
            for record in records {
                file.write_all(record).await?;
            }
            file.sync_all().await?;
        }
        fs::rename(&tmp, &self.path).await
    }

    async fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
            _ => Ok(()),
        }
    }

    /// Appends `payload`, dropping the oldest records beyond the bound.
    pub async fn push(&self, payload: &MonitoringPayload) -> io::Result<()> {
        self.ensure_parent().await?;
        let record = encode_record(payload)?;
        let (mut records, clean) = self.read_file().await?;

        if clean && records.len() < self.max_records {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&record).await?;
            file.sync_all().await?;
        } else {
            let excess = (records.len() + 1).saturating_sub(self.max_records);
            if excess > 0 {
                warn!("spool is full, dropping {excess} oldest payload(s)");
                records.drain(..excess);
            }
            records.push(record);
            self.write_records(&records).await?;
        }
        debug!("payload spooled to {}", self.path.display());
        Ok(())
    }

    /// Every pending payload, oldest first. Undecodable records are dropped
    /// from the file so positions stay aligned with [`Spool::remove_first`].
    pub async fn pending(&self) -> io::Result<Vec<MonitoringPayload>> {
        let (records, clean) = self.read_file().await?;
        let total = records.len();
        let mut kept = Vec::with_capacity(total);
        let mut payloads = Vec::with_capacity(total);
        for record in records {
            match postcard::from_bytes(&record[4..]) {
                Ok(payload) => {
                    payloads.push(payload);
                    kept.push(record);
                }
                Err(e) => warn!("dropping undecodable spool record: {e}"),
            }
        }
        if !clean || kept.len() != total {
            self.write_records(&kept).await?;
        }
        Ok(payloads)
    }

    pub async fn len(&self) -> io::Result<usize> {
        Ok(self.read_records().await?.len())
    }

    /// Removes the `count` oldest records after they were delivered.
    pub async fn remove_first(&self, count: usize) -> io::Result<()> {
        if count == 0 {
            return Ok(());
        }
        let records = self.read_records().await?;
        let rest = records.get(count..).unwrap_or_default();
        self.write_records(rest).await
    }
}
