// 云端录像
// 对已建立的会话开启流媒体 MP4 录制；超出最长时长自动停止，过期文件定期清理

use crate::gateway::{unix_now, Gateway};
use crate::notify::Notify as NotifyEvent;
use crate::store::{record_file, PAGE_SIZE};
use crate::{GatewayError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sea_orm::Set;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// 自动停止后等待录像完成回调的时间
const RECORD_URL_WAIT: Duration = Duration::from_secs(60);

/// 进行中的录像任务
pub struct RecordingJob {
    pub job_id: String,
    /// 调用方参数，随 records.stop 通知回传
    pub params: HashMap<String, String>,
    stop: Arc<Notify>,
    url_tx: Option<oneshot::Sender<String>>,
}

/// stream id -> 录像任务
#[derive(Default)]
pub struct RecordingTable {
    jobs: DashMap<String, RecordingJob>,
}

impl RecordingTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gateway {
    /// 开始录像，返回任务 ID
    pub async fn start_recording(
        self: &Arc<Self>,
        stream_id: &str,
        params: HashMap<String, String>,
    ) -> Result<String> {
        if self.sessions.get(stream_id).is_none() {
            return Err(GatewayError::StreamNotFound(stream_id.to_string()));
        }

        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let stop = Arc::new(Notify::new());
        let recordmax = self.config.record.recordmax;
        let (url_tx, url_rx) = if recordmax != -1 {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // 先占位，并发的第二次请求不会再触发流媒体录制
        match self.recordings.jobs.entry(stream_id.to_string()) {
            Entry::Occupied(_) => return Err(GatewayError::RecordingExists(stream_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RecordingJob {
                    job_id: job_id.clone(),
                    params: params.clone(),
                    stop: stop.clone(),
                    url_tx,
                });
            }
        }

        if let Err(e) = self.media.start_record(stream_id).await {
            self.release_job(stream_id, &job_id);
            return Err(e);
        }

        let inserted = self
            .store
            .insert_record_file(record_file::ActiveModel {
                job_id: Set(job_id.clone()),
                stream_id: Set(stream_id.to_string()),
                start: Set(unix_now()),
                end: Set(0),
                file: Set(String::new()),
                status: Set(record_file::STATUS_RECORDING),
                cleared: Set(false),
                msg: Set(String::new()),
                ..Default::default()
            })
            .await;
        if let Err(e) = inserted {
            self.release_job(stream_id, &job_id);
            if let Err(stop_err) = self.media.stop_record(stream_id).await {
                tracing::warn!(target: "gb28181::record", %stream_id, "Stop record failed: {}", stop_err);
            }
            return Err(e);
        }

        if let Some(url_rx) = url_rx {
            let gateway = self.clone();
            let stream_id = stream_id.to_string();
            let limit = Duration::from_secs(recordmax.max(0) as u64);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        gateway.auto_stop(&stream_id, url_rx, params).await;
                    }
                    _ = stop.notified() => {}
                }
            });
        }

        tracing::info!(target: "gb28181::record", %stream_id, %job_id, recordmax, "Recording started");
        Ok(job_id)
    }

    fn release_job(&self, stream_id: &str, job_id: &str) {
        self.recordings
            .jobs
            .remove_if(stream_id, |_, job| job.job_id == job_id);
    }

    async fn auto_stop(
        &self,
        stream_id: &str,
        url_rx: oneshot::Receiver<String>,
        params: HashMap<String, String>,
    ) {
        tracing::info!(target: "gb28181::record", %stream_id, "Recording reached max duration");
        if let Err(e) = self.media.stop_record(stream_id).await {
            tracing::warn!(target: "gb28181::record", %stream_id, "Auto stop failed: {}", e);
            return;
        }
        match tokio::time::timeout(RECORD_URL_WAIT, url_rx).await {
            Ok(Ok(url)) => self.notifier.emit(NotifyEvent::records_stop(&url, &params)),
            _ => {
                tracing::warn!(target: "gb28181::record", %stream_id, "No record file reported after auto stop");
            }
        }
    }

    /// 停止录像；文件完成由 on_record_mp4 回调落库
    pub async fn stop_recording(&self, stream_id: &str) -> Result<()> {
        let stop = self
            .recordings
            .jobs
            .get(stream_id)
            .map(|job| job.stop.clone())
            .ok_or_else(|| GatewayError::RecordingNotFound(stream_id.to_string()))?;

        self.media.stop_record(stream_id).await?;
        stop.notify_one();
        tracing::info!(target: "gb28181::record", %stream_id, "Recording stop requested");
        Ok(())
    }

    /// 流媒体录像完成回调
    pub(crate) async fn on_record_mp4(&self, stream_id: &str, url: &str) -> Result<()> {
        let Some((_, job)) = self.recordings.jobs.remove(stream_id) else {
            tracing::debug!(target: "gb28181::record", %stream_id, "Record file for unknown job");
            return Ok(());
        };
        self.store
            .finish_record_file(&job.job_id, unix_now(), url)
            .await?;
        if let Some(tx) = job.url_tx {
            let _ = tx.send(format!("{}/{}", self.config.media.http, url));
        }
        tracing::info!(target: "gb28181::record", %stream_id, job_id = %job.job_id, %url, "Recording finished");
        Ok(())
    }

    /// 删除过期录像文件，返回清理的条数
    pub async fn clear_expired_records(&self) -> Result<usize> {
        let cutoff = unix_now() - self.config.record.expire_days() * 86400;
        let root = &self.config.record.filepath;
        let mut after_id = 0;
        let mut cleared = 0;

        loop {
            let page = self.store.expired_record_files(cutoff, after_id).await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            for file in &page {
                let path = root.join(file.file.trim_start_matches('/'));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(
                            target: "gb28181::record",
                            path = %path.display(),
                            "Failed to remove record file: {}",
                            e
                        );
                        self.store.mark_record_error(file.id, &e.to_string()).await?;
                        continue;
                    }
                }
                self.store.mark_record_cleared(file.id).await?;
                cleared += 1;
            }

            if (page.len() as u64) < PAGE_SIZE {
                break;
            }
        }

        if cleared > 0 {
            tracing::info!(target: "gb28181::record", cleared, cutoff, "Expired record files removed");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{gateway, gateway_with};
    use crate::session::{PlayMode, PlayResult, Session, SessionSource};
    use sea_orm::{EntityTrait, QueryFilter, ColumnTrait};

    const STREAM: &str = "34020000001320000001";

    fn live_session(gw: &Gateway) {
        gw.sessions.insert(Session {
            stream_id: STREAM.to_string(),
            channel_id: STREAM.to_string(),
            device_id: String::new(),
            mode: PlayMode::Live,
            source: SessionSource::Pull {
                url: "rtsp://10.0.0.9/live".to_string(),
            },
            confirmed: true,
            expires_at: 0,
            result: PlayResult::new(&gw.config.media, STREAM, STREAM, ""),
        });
    }

    async fn record_row(gw: &Gateway, job_id: &str) -> record_file::Model {
        record_file::Entity::find()
            .filter(record_file::Column::JobId.eq(job_id))
            .one(gw.store.connection())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_and_finish() {
        let (gw, media) = gateway().await;

        let err = gw.start_recording(STREAM, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::StreamNotFound(_)));

        live_session(&gw);
        let job_id = gw.start_recording(STREAM, HashMap::new()).await.unwrap();
        let err = gw.start_recording(STREAM, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RecordingExists(_)));
        assert_eq!(media.count("start_record:"), 1);

        let row = record_row(&gw, &job_id).await;
        assert_eq!(row.status, record_file::STATUS_RECORDING);
        assert!(row.start > 0);

        gw.stop_recording(STREAM).await.unwrap();
        assert_eq!(media.count("stop_record:"), 1);

        gw.on_record_mp4(STREAM, "record/rtp/34020000001320000001/a.mp4")
            .await
            .unwrap();
        let row = record_row(&gw, &job_id).await;
        assert_eq!(row.status, record_file::STATUS_FINISHED);
        assert_eq!(row.file, "record/rtp/34020000001320000001/a.mp4");
        assert!(gw.recordings.jobs.is_empty());

        let err = gw.stop_recording(STREAM).await.unwrap_err();
        assert!(matches!(err, GatewayError::RecordingNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_start_records_once() {
        let (gw, media) = gateway().await;
        live_session(&gw);

        let (a, b) = tokio::join!(
            gw.start_recording(STREAM, HashMap::new()),
            gw.start_recording(STREAM, HashMap::new())
        );
        let (job_id, err) = match (a, b) {
            (Ok(id), Err(e)) | (Err(e), Ok(id)) => (id, e),
            other => panic!("expected one winner, got {:?}", other),
        };
        assert!(matches!(err, GatewayError::RecordingExists(_)));
        assert_eq!(media.count("start_record:"), 1);

        let rows = record_file::Entity::find()
            .filter(record_file::Column::StreamId.eq(STREAM))
            .all(gw.store.connection())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, job_id);
    }

    #[tokio::test]
    async fn test_recordmax_auto_stops() {
        let (gw, media) = gateway_with(|c| c.record.recordmax = 1).await;
        live_session(&gw);
        gw.start_recording(STREAM, HashMap::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(media.count("stop_record:"), 1);

        gw.on_record_mp4(STREAM, "a.mp4").await.unwrap();
        assert!(!gw.recordings.jobs.contains_key(STREAM));
    }

    #[tokio::test]
    async fn test_manual_stop_cancels_timer() {
        let (gw, media) = gateway_with(|c| c.record.recordmax = 1).await;
        live_session(&gw);
        gw.start_recording(STREAM, HashMap::new()).await.unwrap();
        gw.stop_recording(STREAM).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(media.count("stop_record:"), 1);
    }

    #[tokio::test]
    async fn test_clear_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (gw, _) = gateway_with(|c| {
            c.record.filepath = root.clone();
            c.record.expire = 1;
        })
        .await;

        std::fs::write(root.join("old.mp4"), b"x").unwrap();
        std::fs::write(root.join("new.mp4"), b"x").unwrap();
        std::fs::create_dir(root.join("dir.mp4")).unwrap();

        let old = unix_now() - 3 * 86400;
        for (job, file, end) in [
            ("a", "old.mp4", old),
            ("b", "missing.mp4", old),
            ("c", "new.mp4", unix_now()),
            ("d", "/dir.mp4", old),
        ] {
            gw.store
                .insert_record_file(record_file::ActiveModel {
                    job_id: Set(job.to_string()),
                    stream_id: Set(STREAM.to_string()),
                    start: Set(end - 60),
                    end: Set(end),
                    file: Set(file.to_string()),
                    status: Set(record_file::STATUS_FINISHED),
                    cleared: Set(false),
                    msg: Set(String::new()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        assert_eq!(gw.clear_expired_records().await.unwrap(), 2);
        assert!(!root.join("old.mp4").exists());
        assert!(root.join("new.mp4").exists());
        assert!(record_row(&gw, "a").await.cleared);
        assert!(record_row(&gw, "b").await.cleared);
        assert!(!record_row(&gw, "c").await.cleared);

        let failed = record_row(&gw, "d").await;
        assert!(!failed.cleared);
        assert!(!failed.msg.is_empty());
    }
}
