// Maps the captured provider payloads under fixtures/ through each adapter's row mapper.

use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use mkt_adapters::{
    map_market_rows, map_token_day_datas, map_tvl_series, map_warehouse_rows, next_page_cursor,
    GraphResponse, ProtocolTvlResponse, ReferenceIndex, WarehouseResponse, STREAMING_PAGE_SIZE,
};
use mkt_core::{Batch, Resolution, SourceKind, SyncTarget, SyncWindow};

fn fixture(rel: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn batch(targets: Vec<SyncTarget>) -> Batch {
    Batch { index: 0, targets }
}

fn january(days: u32, resolution: Resolution) -> SyncWindow {
    SyncWindow::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1 + days, 0, 0, 0).unwrap(),
        resolution,
    )
    .unwrap()
}

#[test]
fn price_index_fixture_maps_priced_coins_only() {
    let rows = serde_json::from_str(&fixture("price_index/markets.json")).unwrap();
    let targets = batch(vec![
        SyncTarget::new("bitcoin", "bitcoin"),
        SyncTarget::new("ethereum", "ethereum"),
        SyncTarget::new("dead-token", "dead-token"),
    ]);
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 10, 0).unwrap();
    let records: Vec<_> =
        map_market_rows(rows, ReferenceIndex::from_batch(&targets), Resolution::Hour, at).collect();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.kind == SourceKind::PriceIndex));
    let btc = records.iter().find(|r| r.entity == "bitcoin").unwrap();
    let payload = btc.payload.as_ref().unwrap();
    assert!(payload["price_change"].get("30d").is_none());
    assert_eq!(payload["market_data"]["market_cap_rank"], 1);
}

#[test]
fn warehouse_fixture_maps_addresses_to_platform_ids() {
    let response: WarehouseResponse =
        serde_json::from_str(&fixture("analytics_warehouse/uniswap_v2_bydate.json")).unwrap();
    let targets = batch(vec![
        SyncTarget::new("101", "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
        SyncTarget::new("102", "0xdac17f958d2ee523a2206206994597c13d831ec7"),
        SyncTarget::new("103", "0x6b175474e89094c44da98b954eedeac495271d0f"),
    ]);
    let records: Vec<_> = map_warehouse_rows(
        response.rows,
        ReferenceIndex::from_batch(&targets),
        "uniswap_v2",
        Resolution::Hour,
    )
    .collect();

    assert_eq!(records.len(), 3);
    assert_eq!(records.iter().filter(|r| r.entity == "101").count(), 2);
    assert!(records.iter().all(|r| r.source == "uniswap_v2"));
}

#[test]
fn streaming_fixture_maps_seconds_into_millisecond_timestamps() {
    let response: GraphResponse =
        serde_json::from_str(&fixture("streaming_index/token_day_datas.json")).unwrap();
    assert_eq!(next_page_cursor(&response.data.token_day_datas, STREAMING_PAGE_SIZE), None);
    let targets = batch(vec![SyncTarget::new(
        "555",
        "0x0e09fabb73bd3ade0a17ecc321fd13a19e81ce82",
    )]);
    let records: Vec<_> = map_token_day_datas(
        response.data.token_day_datas,
        ReferenceIndex::from_batch(&targets),
        january(2, Resolution::Day),
    )
    .collect();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].observed_at.timestamp_millis(), 1_704_067_200_000);
}

#[test]
fn tvl_fixture_drops_points_without_liquidity() {
    let response: ProtocolTvlResponse =
        serde_json::from_str(&fixture("protocol_tvl/uniswap.json")).unwrap();
    let records: Vec<_> = map_tvl_series("7".into(), response, january(5, Resolution::Day)).collect();

    assert_eq!(records.len(), 2);
    let chains = &records[0].payload.as_ref().unwrap()["chain_tvls"];
    assert_eq!(chains.as_object().unwrap().len(), 2);
}
