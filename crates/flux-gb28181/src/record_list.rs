// 设备录像查询
// RecordInfo 可能分多包上报，按 (通道, SN) 聚合后合并为按天分组的时间段

use crate::catalog::normalize_status;
use crate::gateway::{unix_now, Gateway};
use crate::manscdp::{ManscdpMessage, Query};
use crate::play::CHANNEL_ACTIVE_WINDOW;
use crate::{GatewayError, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// 等待设备上报完成的最长时间，超时返回已收到的部分
const RECORD_LIST_WAIT: Duration = Duration::from_secs(10);

/// MANSCDP 时间格式（设备本地时间）
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// 录像查询结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Records {
    /// 有录像的天数
    #[serde(rename = "daynum")]
    pub day_num: usize,
    /// 时间段总数
    #[serde(rename = "timenum")]
    pub time_num: usize,
    pub list: Vec<RecordDate>,
}

/// 一天内的录像时间段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordDate {
    pub date: String,
    pub items: Vec<RecordSpan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordSpan {
    pub start: i64,
    pub end: i64,
}

/// `ts` 所在本地日期及其起止时间戳
fn day_bounds<Tz: TimeZone>(ts: i64, tz: &Tz) -> Option<(String, i64, i64)> {
    let date = tz.timestamp_opt(ts, 0).earliest()?.date_naive();
    let start = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .timestamp();
    let end = tz
        .from_local_datetime(&date.succ_opt()?.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .timestamp();
    Some((date.format("%Y-%m-%d").to_string(), start, end))
}

/// 合并时间段：按开始时间排序，首尾相接或重叠的合并，再按本地零点拆分到各天
pub fn merge<Tz: TimeZone>(mut spans: Vec<(i64, i64)>, tz: &Tz) -> Records {
    spans.retain(|(start, end)| start <= end);
    spans.sort_unstable();

    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let mut records = Records::default();
    let mut push = |date: String, start: i64, end: i64| {
        records.time_num += 1;
        match records.list.iter_mut().find(|d| d.date == date) {
            Some(day) => day.items.push(RecordSpan { start, end }),
            None => {
                records.day_num += 1;
                records.list.push(RecordDate {
                    date,
                    items: vec![RecordSpan { start, end }],
                });
            }
        }
    };

    for (start, end) in merged {
        let mut from = start;
        while let Some((date, day_start, day_end)) = day_bounds(from, tz) {
            let item_start = from.max(day_start);
            if end < day_end {
                push(date, item_start, end);
                break;
            }
            push(date, item_start, day_end - 1);
            if end == day_end {
                break;
            }
            from = day_end;
        }
    }
    records
}

fn parse_local(s: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), TIME_FORMAT).ok()?;
    Some(Local.from_local_datetime(&naive).earliest()?.timestamp())
}

fn format_local(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .earliest()
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

struct PendingQuery {
    start: i64,
    end: i64,
    spans: Vec<(i64, i64)>,
    count: usize,
    done: Arc<Notify>,
}

/// 进行中的录像查询
#[derive(Default)]
pub struct RecordQueries {
    pending: DashMap<String, PendingQuery>,
}

impl RecordQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记查询，返回完成信号
    pub fn register(&self, key: &str, start: i64, end: i64) -> Arc<Notify> {
        let done = Arc::new(Notify::new());
        self.pending.insert(
            key.to_string(),
            PendingQuery {
                start,
                end,
                spans: Vec::new(),
                count: 0,
                done: done.clone(),
            },
        );
        done
    }

    /// 累积一包 RecordInfo；返回是否匹配到进行中的查询
    pub fn on_record_info(&self, msg: &ManscdpMessage) -> bool {
        let key = format!("{}{}", msg.device_id, msg.sn.unwrap_or_default());
        let Some(mut query) = self.pending.get_mut(&key) else {
            tracing::debug!(target: "gb28181::record", %key, "RecordInfo for unknown query");
            return false;
        };

        let items = msg.record_items();
        query.count += items.len();
        for item in items {
            let (Some(start), Some(end)) = (parse_local(&item.start_time), parse_local(&item.end_time)) else {
                tracing::debug!(
                    target: "gb28181::record",
                    start = %item.start_time,
                    end = %item.end_time,
                    "Unparsable record time, skipped"
                );
                continue;
            };
            let span = (start.max(query.start), end.min(query.end));
            query.spans.push(span);
        }

        if query.count >= msg.sum_num.unwrap_or_default() {
            query.done.notify_one();
        }
        true
    }

    /// 移除查询并取出已收到的时间段
    pub fn take(&self, key: &str) -> Vec<(i64, i64)> {
        self.pending
            .remove(key)
            .map(|(_, q)| q.spans)
            .unwrap_or_default()
    }
}

impl Gateway {
    /// 查询通道在设备上的录像；超时返回已收到的部分
    pub async fn record_list(&self, channel_id: &str, start: i64, end: i64) -> Result<Records> {
        if start >= end {
            return Err(GatewayError::InvalidMessage(
                "record list requires start < end".to_string(),
            ));
        }
        let channel = self
            .store
            .find_channel(channel_id)
            .await?
            .ok_or_else(|| GatewayError::ChannelNotFound(channel_id.to_string()))?;
        if normalize_status(&channel.status) != "ON"
            || unix_now() - channel.active > CHANNEL_ACTIVE_WINDOW
        {
            return Err(GatewayError::ChannelOffline(channel_id.to_string()));
        }
        let device = self
            .devices
            .lookup(&channel.device_id)
            .ok_or_else(|| GatewayError::DeviceOffline(channel.device_id.clone()))?;

        let sn = Gateway::next_sn();
        let key = format!("{}{}", channel_id, sn);
        let done = self.record_queries.register(&key, start, end);

        let query = Query::record_info(sn, channel_id, format_local(start), format_local(end));
        let to = self.channel_addr(channel_id, &channel.uri);
        if let Err(e) = self.send_message(&device, to, query.to_xml()).await {
            self.record_queries.take(&key);
            return Err(e);
        }

        let completed = tokio::time::timeout(RECORD_LIST_WAIT, done.notified())
            .await
            .is_ok();
        let spans = self.record_queries.take(&key);
        if !completed {
            tracing::info!(
                target: "gb28181::record",
                %channel_id,
                received = spans.len(),
                "RecordInfo incomplete, returning partial result"
            );
        }
        Ok(merge(spans, &Local))
    }
}
