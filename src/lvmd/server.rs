// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! lvmd serves its volume service on a Unix-domain socket. Each request is
//! one line of JSON and is answered by one line of JSON. A Watch request
//! keeps the connection open and streams one line per capacity change.

use std::{
    fs::{create_dir_all, remove_file},
    path::Path,
    sync::Arc,
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

use crate::{
    engine::EngineAction,
    lvmcsi::{ErrorCode, LvmCsiError, LvmCsiResult},
    lvmd::{
        interface::{lvmcsi_result_to_return, LvmdParams, LvmdRet},
        service::LvService,
    },
};

pub(super) async fn write_line<W, T>(writer: &mut W, value: &T) -> LvmCsiResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

impl LvmdParams {
    async fn process(self, service: &dyn LvService) -> LvmdRet {
        match self {
            LvmdParams::CreateLV(request) => {
                let (info, rc, rs) =
                    lvmcsi_result_to_return(service.create_lv(request).await.map(Some), None);
                LvmdRet::CreateLV(info, rc, rs)
            }
            LvmdParams::CreateLVSnapshot(request) => {
                let (info, rc, rs) = lvmcsi_result_to_return(
                    service.create_lv_snapshot(request).await.map(Some),
                    None,
                );
                LvmdRet::CreateLVSnapshot(info, rc, rs)
            }
            LvmdParams::ResizeLV(request) => {
                let (size, rc, rs) = lvmcsi_result_to_return(
                    service.resize_lv(request).await.map(|a| a.changed()),
                    None,
                );
                LvmdRet::ResizeLV(size, rc, rs)
            }
            LvmdParams::RemoveLV(request) => {
                let (name, rc, rs) = lvmcsi_result_to_return(
                    service.remove_lv(request).await.map(|a| a.changed()),
                    None,
                );
                LvmdRet::RemoveLV(name, rc, rs)
            }
            LvmdParams::GetLVList(device_class) => {
                let (lvs, rc, rs) =
                    lvmcsi_result_to_return(service.get_lv_list(&device_class).await, Vec::new());
                LvmdRet::GetLVList(lvs, rc, rs)
            }
            LvmdParams::GetFreeBytes(device_class) => {
                let (free, rc, rs) =
                    lvmcsi_result_to_return(service.get_free_bytes(&device_class).await, 0);
                LvmdRet::GetFreeBytes(free, rc, rs)
            }
            LvmdParams::Watch => LvmdRet::Watch(
                None,
                ErrorCode::InvalidArgument,
                "Watch must be the only request on its connection".to_string(),
            ),
        }
    }
}

async fn stream_capacity<W>(service: &dyn LvService, writer: &mut W) -> LvmCsiResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut receiver = match service.watch().await {
        Ok(receiver) => receiver,
        Err(e) => {
            return write_line(writer, &LvmdRet::Watch(None, e.code(), e.message())).await;
        }
    };
    while let Some(response) = receiver.recv().await {
        write_line(
            writer,
            &LvmdRet::Watch(Some(response), ErrorCode::Ok, ErrorCode::Ok.to_string()),
        )
        .await?;
    }
    Ok(())
}

async fn handle_connection(service: Arc<dyn LvService>, stream: UnixStream) -> LvmCsiResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let params: LvmdParams = serde_json::from_str(&line).map_err(|e| {
            LvmCsiError::Chained(
                "Failed to parse request".to_string(),
                Box::new(LvmCsiError::Serde(e)),
            )
        })?;
        trace!("Received request {params:?}");
        match params {
            LvmdParams::Watch => return stream_capacity(service.as_ref(), &mut writer).await,
            params => {
                let ret = params.process(service.as_ref()).await;
                write_line(&mut writer, &ret).await?;
            }
        }
    }
    Ok(())
}

pub struct LvmdServer {
    service: Arc<dyn LvService>,
    listener: UnixListener,
}

impl LvmdServer {
    /// Bind the socket at path, replacing any stale socket left behind by a
    /// previous instance.
    pub fn new<P>(service: Arc<dyn LvService>, path: P) -> LvmCsiResult<LvmdServer>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        if path.exists() {
            remove_file(path)?;
        }
        let listener = UnixListener::bind(path).map_err(|e| {
            LvmCsiError::Chained(
                format!("Failed to bind lvmd socket {}", path.display()),
                Box::new(LvmCsiError::Io(e)),
            )
        })?;
        info!("lvmd listening on {}", path.display());
        Ok(LvmdServer { service, listener })
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(service, stream).await {
                            warn!("Failed to serve lvmd connection: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept lvmd connection: {e}");
                }
            }
        }
    }
}

/// Serve the volume service on the socket at path until the task is
/// cancelled.
pub async fn run_server<P>(service: Arc<dyn LvService>, path: P) -> LvmCsiResult<()>
where
    P: AsRef<Path>,
{
    LvmdServer::new(service, path)?.run().await;
    Ok(())
}
