// 推流会话巡检
// 存储中未关闭的推流会话逐页核对：流媒体侧已无流的发送 BYE 并关闭

use crate::gateway::{unix_now, Gateway};
use crate::play::CONFIRM_WINDOW;
use crate::session::Dialog;
use crate::store::stream;
use crate::Result;
use serde::Serialize;

/// 一次巡检的统计
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub skipped: usize,
    pub closed: usize,
    pub failed: usize,
}

enum Verdict {
    Skip,
    Closed,
    Failed,
}

impl Gateway {
    /// 巡检所有未关闭的推流会话
    pub async fn reconcile_streams(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut after_id = 0;

        loop {
            let page = self.store.open_push_streams(after_id).await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            for row in &page {
                report.scanned += 1;
                match self.reconcile_row(row).await {
                    Ok(Verdict::Skip) => report.skipped += 1,
                    Ok(Verdict::Closed) => report.closed += 1,
                    Ok(Verdict::Failed) => report.failed += 1,
                    Err(e) => {
                        tracing::warn!(target: "gb28181::reconcile", stream_id = %row.stream_id, "Reconcile row failed: {}", e);
                        report.failed += 1;
                    }
                }
            }

            if (page.len() as u64) < crate::store::PAGE_SIZE {
                break;
            }
        }

        if report.closed > 0 || report.failed > 0 {
            tracing::info!(
                target: "gb28181::reconcile",
                scanned = report.scanned,
                closed = report.closed,
                failed = report.failed,
                "Stream reconcile finished"
            );
        }
        Ok(report)
    }

    async fn reconcile_row(&self, row: &stream::Model) -> Result<Verdict> {
        let now = unix_now();
        let stream_id = row.stream_id.as_str();

        let session = self.sessions.get(stream_id);
        if let Some(session) = &session {
            if session.channel_id == row.channel_id {
                match self.media.stream_exists(stream_id).await {
                    Ok(true) => return Ok(Verdict::Skip),
                    Ok(false) if !session.confirmed && now < session.expires_at => {
                        return Ok(Verdict::Skip);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(target: "gb28181::reconcile", %stream_id, "Probe failed, skipped: {}", e);
                        return Ok(Verdict::Skip);
                    }
                }
            }
        }

        // 对话已写入但会话尚未登记（点播进行中或刚重启），等到确认期过后再处理
        if session.is_none() && !row.call_id.is_empty() && now < row.expires_at {
            return Ok(Verdict::Skip);
        }

        // 协商中断，没有可用的对话
        if row.call_id.is_empty() {
            if now - row.created_at < CONFIRM_WINDOW {
                return Ok(Verdict::Skip);
            }
            self.sessions.remove(stream_id);
            self.store
                .close_stream(stream_id, false, Some("negotiation not completed".to_string()))
                .await?;
            return Ok(Verdict::Closed);
        }

        let Some(device) = self.devices.lookup(&row.device_id) else {
            tracing::debug!(target: "gb28181::reconcile", %stream_id, device_id = %row.device_id, "Device offline, skipped");
            return Ok(Verdict::Skip);
        };

        self.sessions.remove(stream_id);
        let uri = self
            .store
            .find_channel(&row.channel_id)
            .await?
            .map(|c| c.uri)
            .unwrap_or_default();
        let dialog = Dialog::from_row(
            row,
            self.sip.server_addr(),
            self.channel_addr(&row.channel_id, &uri),
            device.source,
        );

        match self.send_bye(&dialog).await {
            Ok(resp) if resp.is_success() => {
                self.store.close_stream(stream_id, true, None).await?;
                if let Err(e) = self.media.close_stream(stream_id).await {
                    tracing::warn!(target: "gb28181::reconcile", %stream_id, "Close stream failed: {}", e);
                }
                Ok(Verdict::Closed)
            }
            Ok(resp) if resp.status_code == 481 => {
                // 设备已无此对话
                self.store
                    .close_stream(stream_id, false, Some(resp.reason_phrase))
                    .await?;
                Ok(Verdict::Closed)
            }
            Ok(resp) => {
                self.store
                    .mark_stream_error(stream_id, format!("{} {}", resp.status_code, resp.reason_phrase))
                    .await?;
                Ok(Verdict::Failed)
            }
            Err(crate::sip::SipError::Timeout) => {
                self.store.mark_stream_error(stream_id, "response timeout").await?;
                Ok(Verdict::Failed)
            }
            Err(e) => {
                self.store.mark_stream_error(stream_id, e.to_string()).await?;
                Ok(Verdict::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::gateway;
    use crate::play::testing::*;
    use crate::play::PlayRequest;
    use crate::sip::SipMethod;
    use sea_orm::Set;
    use tokio::sync::broadcast;

    fn pending_row(stream_id: &str, created_at: i64) -> stream::ActiveModel {
        stream::ActiveModel {
            stream_id: Set(stream_id.to_string()),
            ssrc: Set(String::new()),
            channel_id: Set(CHANNEL_ID.to_string()),
            device_id: Set(DEVICE_ID.to_string()),
            mode: Set(0),
            stream_type: Set("push".to_string()),
            status: Set(stream::STATUS_PENDING),
            confirmed: Set(false),
            call_id: Set(String::new()),
            cseq: Set(0),
            ftag: Set(serde_json::json!({})),
            ttag: Set(serde_json::json!({})),
            stop: Set(false),
            msg: Set(String::new()),
            expires_at: Set(0),
            created_at: Set(created_at),
            ..Default::default()
        }
    }

    async fn expire_row(gw: &Gateway, stream_id: &str) {
        gw.store
            .update_open_stream(
                stream_id,
                stream::ActiveModel {
                    expires_at: Set(unix_now() - 1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_rows_closed_after_grace() {
        let (gw, _) = gateway().await;
        let now = unix_now();
        gw.store.insert_stream(pending_row("0BEBC201", now)).await.unwrap();
        gw.store
            .insert_stream(pending_row("0BEBC202", now - 600))
            .await
            .unwrap();

        let report = gw.reconcile_streams().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.closed, 1);
        assert!(gw.store.find_open_stream("0BEBC201").await.unwrap().is_some());
        assert!(gw.store.find_open_stream("0BEBC202").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_stream_kept_and_dead_stream_closed() {
        let (gw, media) = gateway().await;
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);
        let sock = online_device(&gw).await;

        let player = gw.clone();
        let play = tokio::spawn(async move { player.play(PlayRequest::live(CHANNEL_ID)).await });
        let invite = accept_invite(&sock).await;
        let result = play.await.unwrap().unwrap();
        gw.sessions.confirm(&result.stream_id);

        media.set_live(&result.stream_id);
        let report = gw.reconcile_streams().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(gw.sessions.get(&result.stream_id).is_some());

        // 流媒体侧已无流：发送 BYE 并关闭
        media.live.lock().unwrap().clear();
        let sweeper = gw.clone();
        let sweep = tokio::spawn(async move { sweeper.reconcile_streams().await });
        let (bye, from) = expect_request(&sock, SipMethod::Bye).await;
        assert_eq!(bye.headers.call_id(), invite.headers.call_id());
        answer(&sock, &bye, from, 200).await;

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.closed, 1);
        assert!(gw.sessions.get(&result.stream_id).is_none());
        let open = gw.store.find_open_stream(&result.stream_id).await.unwrap();
        assert!(open.is_none());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_unconfirmed_within_window_and_probe_error_skipped() {
        let (gw, media) = gateway().await;
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);
        let sock = online_device(&gw).await;

        let player = gw.clone();
        let play = tokio::spawn(async move { player.play(PlayRequest::live(CHANNEL_ID)).await });
        accept_invite(&sock).await;
        let result = play.await.unwrap().unwrap();

        let report = gw.reconcile_streams().await.unwrap();
        assert_eq!(report.skipped, 1);

        media
            .fail_probe
            .store(true, std::sync::atomic::Ordering::SeqCst);
        gw.sessions.confirm(&result.stream_id);
        let report = gw.reconcile_streams().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(gw.store.find_open_stream(&result.stream_id).await.unwrap().is_some());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_bye_rejection_keeps_row_with_error() {
        let (gw, _) = gateway().await;
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);
        let sock = online_device(&gw).await;

        let player = gw.clone();
        let play = tokio::spawn(async move { player.play(PlayRequest::live(CHANNEL_ID)).await });
        accept_invite(&sock).await;
        let result = play.await.unwrap().unwrap();
        // 重启后内存会话丢失，且已过确认期
        gw.sessions.remove(&result.stream_id);
        expire_row(&gw, &result.stream_id).await;

        let sweeper = gw.clone();
        let sweep = tokio::spawn(async move { sweeper.reconcile_streams().await });
        let (bye, from) = expect_request(&sock, SipMethod::Bye).await;
        answer(&sock, &bye, from, 500).await;
        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.failed, 1);

        let row = gw.store.find_open_stream(&result.stream_id).await.unwrap().unwrap();
        assert!(row.msg.starts_with("500"));

        // 481：设备已无对话，直接关闭
        let sweeper = gw.clone();
        let sweep = tokio::spawn(async move { sweeper.reconcile_streams().await });
        let (bye, from) = expect_request(&sock, SipMethod::Bye).await;
        answer(&sock, &bye, from, 481).await;
        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.closed, 1);
        assert!(gw.store.find_open_stream(&result.stream_id).await.unwrap().is_none());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_dialog_row_without_session_waits_for_expiry() {
        let (gw, _) = gateway().await;
        let _sock = online_device(&gw).await;
        let mut row = pending_row("0BEBC201", unix_now());
        row.call_id = Set("c1".to_string());
        row.status = Set(stream::STATUS_ACTIVE);
        row.expires_at = Set(unix_now() + CONFIRM_WINDOW);
        gw.store.insert_stream(row).await.unwrap();

        let report = gw.reconcile_streams().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(gw.store.find_open_stream("0BEBC201").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_row_error_does_not_abort_pass() {
        use sea_orm::ConnectionTrait;

        let (gw, _) = gateway().await;
        let _sock = online_device(&gw).await;
        let now = unix_now();
        let mut broken = pending_row("0BEBC201", now - 600);
        broken.call_id = Set("c1".to_string());
        broken.status = Set(stream::STATUS_ACTIVE);
        gw.store.insert_stream(broken).await.unwrap();
        gw.store
            .insert_stream(pending_row("0BEBC202", now - 600))
            .await
            .unwrap();

        // 通道表不可用时第一行查询失败
        gw.store
            .connection()
            .execute_unprepared("DROP TABLE channels")
            .await
            .unwrap();

        let report = gw.reconcile_streams().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.closed, 1);
        assert!(gw.store.find_open_stream("0BEBC201").await.unwrap().is_some());
        assert!(gw.store.find_open_stream("0BEBC202").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_pass_over_closed_rows_is_idle() {
        let (gw, _) = gateway().await;
        let (shutdown, _) = broadcast::channel(1);
        gw.start(&shutdown);
        let sock = online_device(&gw).await;

        let player = gw.clone();
        let play = tokio::spawn(async move { player.play(PlayRequest::live(CHANNEL_ID)).await });
        accept_invite(&sock).await;
        let result = play.await.unwrap().unwrap();
        let stopper = gw.clone();
        let stream_id = result.stream_id.clone();
        let stop = tokio::spawn(async move { stopper.stop(&stream_id).await });
        let (bye, from) = expect_request(&sock, SipMethod::Bye).await;
        answer(&sock, &bye, from, 200).await;
        stop.await.unwrap().unwrap();

        for _ in 0..2 {
            let report = gw.reconcile_streams().await.unwrap();
            assert_eq!(report, ReconcileReport::default());
        }
        // 设备侧不应再收到 BYE
        let mut buf = [0u8; 2048];
        let idle = tokio::time::timeout(std::time::Duration::from_millis(300), sock.recv_from(&mut buf)).await;
        assert!(idle.is_err());

        let _ = shutdown.send(());
    }
}
