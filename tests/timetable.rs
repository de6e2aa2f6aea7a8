mod common;

use chrono::{TimeZone, Utc};
use common::*;
use pretty_assertions::assert_eq;
use range_breakout_bot::audit::IncidentKind;
use range_breakout_bot::error::ConfigError;
use range_breakout_bot::execution::simulated::SimCall;
use range_breakout_bot::stream::{CommitReason, StreamState};
use range_breakout_bot::types::{Instrument, StreamId};
use range_breakout_bot::Timetable;

#[tokio::test]
async fn foreign_timezone_rejects_whole_timetable() {
    let mut h = Harness::new();
    let mut tt = timetable();
    tt.timezone = "America/New_York".into();

    let err = h.engine.apply_timetable(&tt, utc(12, 55)).await.unwrap_err();
    assert!(matches!(err, ConfigError::TimezoneMismatch { .. }));
    assert_eq!(h.engine.streams().count(), 0);
    assert!(!h.engine.timetable_valid());
    assert_eq!(h.incident_kinds(), vec![IncidentKind::TimetableRejected]);
}

#[tokio::test]
async fn stale_trading_date_is_rejected() {
    let mut h = Harness::new();
    let mut tt = timetable();
    tt.trading_date = date().pred_opt().unwrap();

    let err = h.engine.apply_timetable(&tt, utc(12, 55)).await.unwrap_err();
    assert!(matches!(err, ConfigError::StaleTradingDate { .. }));
    assert_eq!(h.engine.streams().count(), 0);
}

#[tokio::test]
async fn rejected_timetable_stands_existing_streams_down() {
    let mut h = Harness::new();
    h.start(utc(12, 55)).await;
    h.feed_all(&range_bars()).await;

    let mut bad = timetable();
    bad.timezone = "UTC".into();
    assert!(h.engine.apply_timetable(&bad, utc(14, 1)).await.is_err());

    h.feed(&long_breakout_bar(14, 0)).await;
    assert_eq!(h.sim.entry_count(), 0);
    assert_eq!(h.stream().journal().commit_reason, Some(CommitReason::EntryBlocked));
}

#[tokio::test]
async fn bad_entries_skip_only_themselves() {
    let mut h = Harness::new();
    let mut unknown = entry("NQ1");
    unknown.instrument = Instrument("NQ".into());
    let mut bad_slot = entry("ES2");
    bad_slot.slot_time = hm(9, 15);
    let tt = Timetable {
        trading_date: date(),
        timezone: TZ.into(),
        streams: vec![unknown, entry("ES1"), bad_slot, entry("")],
    };

    let report = h.engine.apply_timetable(&tt, utc(12, 55)).await.unwrap();
    assert_eq!(report.created, vec![key()]);
    let skipped: Vec<StreamId> = report.skipped.into_iter().map(|(id, _)| id).collect();
    assert_eq!(
        skipped,
        vec![StreamId("NQ1".into()), StreamId("ES2".into()), StreamId("".into())]
    );
}

#[tokio::test]
async fn reapplying_keeps_existing_streams() {
    let mut h = Harness::new();
    h.start(utc(12, 55)).await;
    h.feed_all(&range_bars()).await;

    let mut moved = timetable();
    moved.streams[0].slot_time = hm(9, 30);
    let report = h.engine.apply_timetable(&moved, utc(14, 1)).await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(h.stream().identity().slot_time, hm(9, 0));
    assert_eq!(h.stream().state(), StreamState::RangeLocked);
}

#[tokio::test]
async fn disabling_an_idle_stream_concludes_it() {
    let mut h = Harness::new();
    h.start(utc(12, 55)).await;

    let mut off = timetable();
    off.streams[0].enabled = false;
    let report = h.engine.apply_timetable(&off, utc(13, 10)).await.unwrap();
    assert_eq!(report.disabled, vec![key()]);
    assert_eq!(h.stream().state(), StreamState::NoTrade);
    assert_eq!(
        h.stream().journal().commit_reason,
        Some(CommitReason::DisabledByTimetable)
    );
}

#[tokio::test]
async fn disabling_after_entry_does_not_touch_the_trade() {
    let mut h = Harness::new();
    h.run_to_entry().await;

    let mut off = timetable();
    off.streams[0].enabled = false;
    let report = h.engine.apply_timetable(&off, utc(14, 6)).await.unwrap();
    assert!(report.disabled.is_empty());
    assert_eq!(h.stream().state(), StreamState::RangeLocked);
}

#[tokio::test]
async fn alias_symbol_trades_its_own_contract_on_canonical_bars() {
    let mut h = Harness::new();
    let mut micro = entry("ES1");
    micro.execution_instrument = Some(Instrument("MES".into()));
    let tt = Timetable {
        trading_date: date(),
        timezone: TZ.into(),
        streams: vec![micro],
    };
    h.sim.set_clock(utc(12, 55));
    h.engine.apply_timetable(&tt, utc(12, 55)).await.unwrap();
    h.feed_all(&range_bars()).await;
    h.feed(&long_breakout_bar(14, 0)).await;

    assert_eq!(h.stream().identity().canonical_instrument, Instrument("ES".into()));
    let entries: Vec<Instrument> = h
        .sim
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            SimCall::Entry(order) => Some(order.instrument),
            _ => None,
        })
        .collect();
    assert_eq!(entries, vec![Instrument("MES".into())]);
}

#[tokio::test]
async fn date_rollover_drops_streams_and_requires_a_new_timetable() {
    let mut h = Harness::new();
    h.start(utc(12, 55)).await;
    assert!(h.engine.timetable_valid());

    let next_morning = Utc.with_ymd_and_hms(2025, 7, 2, 12, 0, 0).unwrap();
    h.engine.tick(next_morning).await;

    assert_eq!(h.engine.streams().count(), 0);
    assert!(!h.engine.timetable_valid());
    assert_eq!(h.engine.trading_date(), date().succ_opt());
}
