// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UnixStream,
    sync::mpsc,
};

use crate::{
    engine::{DeleteAction, GrowAction},
    lvmcsi::{LvmCsiError, LvmCsiResult},
    lvmd::{
        interface::{
            return_to_lvmcsi_result, CreateLvRequest, CreateLvSnapshotRequest, LogicalVolumeInfo,
            LvmdParams, LvmdRet, RemoveLvRequest, ResizeLvRequest, WatchResponse,
        },
        server::write_line,
        service::LvService,
    },
};

const WATCH_BUFFER: usize = 4;

macro_rules! do_request {
    ($client:expr, $request:ident $(, $arg:expr)?) => {{
        match $client.request(&LvmdParams::$request$(($arg))?).await? {
            LvmdRet::$request(value, code, msg) => return_to_lvmcsi_result(value, code, msg),
            _ => Err(LvmCsiError::Msg(
                "Request and response types did not match".to_string(),
            )),
        }
    }};
}

fn missing_value(request: &str) -> LvmCsiError {
    LvmCsiError::Msg(format!("lvmd answered {request} without a value"))
}

/// Talks to an lvmd over its Unix socket. Every request uses a fresh
/// connection.
#[derive(Debug, Clone)]
pub struct LvmdClient {
    path: PathBuf,
}

impl LvmdClient {
    pub fn new<P>(path: P) -> LvmdClient
    where
        P: AsRef<Path>,
    {
        LvmdClient {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn connect(&self) -> LvmCsiResult<UnixStream> {
        UnixStream::connect(&self.path).await.map_err(|e| {
            LvmCsiError::Chained(
                format!("Failed to connect to lvmd at {}", self.path.display()),
                Box::new(LvmCsiError::Io(e)),
            )
        })
    }

    async fn request(&self, params: &LvmdParams) -> LvmCsiResult<LvmdRet> {
        let (reader, mut writer) = self.connect().await?.into_split();
        write_line(&mut writer, params).await?;
        match BufReader::new(reader).lines().next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(LvmCsiError::unavailable(
                "lvmd closed the connection without answering",
            )),
        }
    }
}

#[async_trait]
impl LvService for LvmdClient {
    async fn create_lv(&self, request: CreateLvRequest) -> LvmCsiResult<LogicalVolumeInfo> {
        do_request!(self, CreateLV, request)?.ok_or_else(|| missing_value("CreateLV"))
    }

    async fn create_lv_snapshot(
        &self,
        request: CreateLvSnapshotRequest,
    ) -> LvmCsiResult<LogicalVolumeInfo> {
        do_request!(self, CreateLVSnapshot, request)?
            .ok_or_else(|| missing_value("CreateLVSnapshot"))
    }

    async fn resize_lv(&self, request: ResizeLvRequest) -> LvmCsiResult<GrowAction<u64>> {
        Ok(match do_request!(self, ResizeLV, request)? {
            Some(size) => GrowAction::Grown(size),
            None => GrowAction::Identity,
        })
    }

    async fn remove_lv(&self, request: RemoveLvRequest) -> LvmCsiResult<DeleteAction<String>> {
        Ok(match do_request!(self, RemoveLV, request)? {
            Some(name) => DeleteAction::Deleted(name),
            None => DeleteAction::Identity,
        })
    }

    async fn get_lv_list(&self, device_class: &str) -> LvmCsiResult<Vec<LogicalVolumeInfo>> {
        do_request!(self, GetLVList, device_class.to_string())
    }

    async fn get_free_bytes(&self, device_class: &str) -> LvmCsiResult<u64> {
        do_request!(self, GetFreeBytes, device_class.to_string())
    }

    async fn watch(&self) -> LvmCsiResult<mpsc::Receiver<WatchResponse>> {
        let (reader, mut writer) = self.connect().await?.into_split();
        write_line(&mut writer, &LvmdParams::Watch).await?;
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            // Dropping both halves closes the connection, which ends the stream.
            let _writer = writer;
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read capacity from lvmd: {e}");
                        break;
                    }
                };
                match serde_json::from_str(&line) {
                    Ok(LvmdRet::Watch(Some(response), code, _)) if code.is_ok() => {
                        if sender.send(response).await.is_err() {
                            break;
                        }
                    }
                    Ok(LvmdRet::Watch(_, code, msg)) => {
                        warn!("lvmd refused to stream capacity: {code}: {msg}");
                        break;
                    }
                    Ok(_) => {
                        warn!("Request and response types did not match");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to parse capacity from lvmd: {e}");
                        break;
                    }
                }
            }
        });
        Ok(receiver)
    }
}
