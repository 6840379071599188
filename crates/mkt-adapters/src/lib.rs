//! Provider adapter contract plus one adapter per upstream market-data source.
//!
//! Adapters translate a `(Batch, SyncWindow)` request into one or more HTTP
//! calls and map the provider-native rows into canonical [`Record`]s. Rows
//! without an entity reference or a numeric value are dropped, never fatal.
//! Adapters do not retry; that is the caller's job.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use mkt_core::{Batch, Record, Resolution, SourceKind, SyncWindow};
use mkt_storage::{HttpFetcher, ProviderError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mkt-adapters";

/// Target reference that asks the TVL provider for the all-protocol chart.
pub const AGGREGATE_REFERENCE: &str = "*";

pub const PRICE_SOURCE_TAG: &str = "coingecko";
pub const TVL_SOURCE_TAG: &str = "defillama";
pub const STREAMING_SOURCE_TAG: &str = "pancakeswap";

/// Largest `per_page` the markets endpoint honors.
pub const MARKETS_PAGE_LIMIT: usize = 250;
pub const STREAMING_PAGE_SIZE: usize = 1000;

const PRICE_CHANGE_PERIODS: [&str; 6] = ["1h", "24h", "7d", "30d", "200d", "1y"];
const MARKET_DATA_FIELDS: [&str; 8] = [
    "market_cap",
    "market_cap_rank",
    "fully_diluted_valuation",
    "total_volume",
    "high_24h",
    "low_24h",
    "circulating_supply",
    "total_supply",
];

const TOKEN_DAY_DATAS_QUERY: &str = r#"
query TokenDayDatas($first: Int!, $dateFrom: Int!, $tokens: [String!]!, $lastId: String!) {
  tokenDayDatas(
    first: $first
    orderBy: id
    orderDirection: asc
    where: { date_gte: $dateFrom, token_in: $tokens, id_gt: $lastId }
  ) {
    id
    date
    volume: dailyVolumeUSD
    token { id }
  }
}
"#;

/// Lazily mapped provider rows.
pub type RecordIter = Box<dyn Iterator<Item = Record> + Send>;

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub window: &'a SyncWindow,
    pub batch: &'a Batch,
    /// Exchange whose query template the warehouse should run.
    pub exchange: Option<&'a str>,
    /// Use the full-history template instead of the date-bucketed one.
    pub historical: bool,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        request: &FetchRequest<'_>,
    ) -> Result<RecordIter, ProviderError>;
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("provider {0} has no base_url configured")]
    MissingBaseUrl(SourceKind),
    #[error("invalid base_url `{url}` for {kind}: {message}")]
    InvalidBaseUrl {
        kind: SourceKind,
        url: String,
        message: String,
    },
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

pub type AdapterTable = HashMap<SourceKind, Arc<dyn ProviderAdapter>>;

pub fn adapter_for_source(
    kind: SourceKind,
    endpoint: &ProviderEndpoint,
) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
    let base_url = endpoint.base_url.trim().trim_end_matches('/').to_string();
    if base_url.is_empty() {
        return Err(AdapterError::MissingBaseUrl(kind));
    }
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(AdapterError::InvalidBaseUrl {
            kind,
            url: base_url,
            message: "expected an http(s) URL".into(),
        });
    }
    let api_key = endpoint.api_key.clone();

    Ok(match kind {
        SourceKind::PriceIndex => Arc::new(PriceIndexAdapter { base_url, api_key }),
        SourceKind::ProtocolTvl => Arc::new(ProtocolTvlAdapter { base_url }),
        SourceKind::AnalyticsWarehouse => Arc::new(WarehouseAdapter { base_url, api_key }),
        SourceKind::StreamingIndex => Arc::new(StreamingIndexAdapter { base_url }),
    })
}

/// Owned reference → target id lookup, so mapping iterators can outlive the batch borrow.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    ids: HashMap<String, String>,
}

impl ReferenceIndex {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            ids: batch
                .targets
                .iter()
                .map(|t| (t.reference.to_ascii_lowercase(), t.id.clone()))
                .collect(),
        }
    }

    pub fn resolve(&self, reference: &str) -> Option<&str> {
        self.ids
            .get(&reference.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A number that providers sometimes encode as a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumberCell {
    Number(f64),
    Text(String),
}

impl NumberCell {
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            NumberCell::Number(v) => *v,
            NumberCell::Text(s) => s.trim().parse().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

/// Warehouse date cells arrive either bare or wrapped as `{ "value": ... }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DateCell {
    Wrapped { value: String },
    Plain(String),
    Epoch(i64),
}

impl DateCell {
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            DateCell::Wrapped { value } | DateCell::Plain(value) => parse_provider_date(value),
            DateCell::Epoch(secs) => DateTime::from_timestamp(*secs, 0),
        }
    }
}

pub fn parse_provider_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches(" UTC");
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    raw.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Snapshot timestamp for price rows: the request time floored to 10 minutes.
pub fn round_down_ten_minutes(at: DateTime<Utc>) -> DateTime<Utc> {
    let minute = at.minute() - at.minute() % 10;
    at.with_minute(minute)
        .and_then(|dt| dt.with_second(0))
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(at)
}

#[derive(Debug, Clone)]
pub struct PriceIndexAdapter {
    base_url: String,
    api_key: Option<String>,
}

#[async_trait]
impl ProviderAdapter for PriceIndexAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::PriceIndex
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        request: &FetchRequest<'_>,
    ) -> Result<RecordIter, ProviderError> {
        let ids = request.batch.references().collect::<Vec<_>>().join(",");
        let (per_page, pages) = market_pages(request.batch.len());

        let mut rows: Vec<JsonValue> = Vec::with_capacity(request.batch.len());
        for page in 1..=pages {
            let mut req = http.get(&format!("{}/coins/markets", self.base_url)).query(&[
                ("vs_currency", "usd".to_string()),
                ("ids", ids.clone()),
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
                ("price_change_percentage", PRICE_CHANGE_PERIODS.join(",")),
            ]);
            if let Some(key) = &self.api_key {
                req = req.header("x-cg-pro-api-key", key);
            }

            let chunk: Vec<JsonValue> = http.send_json(self.kind().as_str(), req).await?;
            let short = chunk.len() < per_page;
            rows.extend(chunk);
            if short {
                break;
            }
        }
        debug!(requested = request.batch.len(), returned = rows.len(), "market rows fetched");

        Ok(map_market_rows(
            rows,
            ReferenceIndex::from_batch(request.batch),
            request.window.resolution(),
            round_down_ten_minutes(request.requested_at),
        ))
    }
}

/// `(per_page, pages)` needed to cover `ids` coins on the markets endpoint.
pub fn market_pages(ids: usize) -> (usize, usize) {
    let per_page = ids.clamp(1, MARKETS_PAGE_LIMIT);
    (per_page, ids.div_ceil(per_page).max(1))
}

pub fn map_market_rows(
    rows: Vec<JsonValue>,
    index: ReferenceIndex,
    resolution: Resolution,
    observed_at: DateTime<Utc>,
) -> RecordIter {
    Box::new(rows.into_iter().filter_map(move |row| {
        let reference = row.get("id").and_then(JsonValue::as_str)?;
        let Some(entity) = index.resolve(reference) else {
            debug!(reference, "price row for unrequested coin dropped");
            return None;
        };
        let price = row
            .get("current_price")
            .and_then(JsonValue::as_f64)
            .filter(|p| p.is_finite())?;

        let price_change = PRICE_CHANGE_PERIODS
            .iter()
            .filter_map(|period| {
                let key = format!("price_change_percentage_{period}_in_currency");
                row.get(&key)
                    .filter(|v| !v.is_null())
                    .map(|v| ((*period).to_string(), v.clone()))
            })
            .collect::<JsonMap<_, _>>();
        let market_data = MARKET_DATA_FIELDS
            .iter()
            .filter_map(|field| {
                row.get(*field)
                    .filter(|v| !v.is_null())
                    .map(|v| ((*field).to_string(), v.clone()))
            })
            .collect::<JsonMap<_, _>>();

        Some(Record {
            entity: entity.to_string(),
            observed_at,
            source: PRICE_SOURCE_TAG.to_string(),
            kind: SourceKind::PriceIndex,
            resolution,
            value: price,
            payload: Some(json!({
                "price_change": price_change,
                "market_data": market_data,
                "last_updated": row.get("last_updated").cloned().unwrap_or(JsonValue::Null),
            })),
        })
    }))
}

#[derive(Debug, Clone)]
pub struct ProtocolTvlAdapter {
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TvlPoint {
    pub date: Option<DateCell>,
    #[serde(rename = "totalLiquidityUSD")]
    pub total_liquidity_usd: Option<NumberCell>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainTvl {
    #[serde(default)]
    pub tvl: Vec<TvlPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtocolTvlResponse {
    #[serde(default)]
    pub tvl: Vec<TvlPoint>,
    #[serde(default, rename = "chainTvls")]
    pub chain_tvls: BTreeMap<String, ChainTvl>,
}

#[async_trait]
impl ProviderAdapter for ProtocolTvlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::ProtocolTvl
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        request: &FetchRequest<'_>,
    ) -> Result<RecordIter, ProviderError> {
        let mut out: Vec<RecordIter> = Vec::with_capacity(request.batch.len());
        for target in &request.batch.targets {
            let response = if target.reference == AGGREGATE_REFERENCE {
                let series: Vec<TvlPoint> = http
                    .send_json(self.kind().as_str(), http.get(&format!("{}/charts", self.base_url)))
                    .await?;
                ProtocolTvlResponse {
                    tvl: series,
                    chain_tvls: BTreeMap::new(),
                }
            } else {
                let url = format!("{}/protocol/{}", self.base_url, target.reference);
                http.send_json(self.kind().as_str(), http.get(&url)).await?
            };
            out.push(map_tvl_series(target.id.clone(), response, *request.window));
        }
        Ok(Box::new(out.into_iter().flatten()))
    }
}

pub fn map_tvl_series(entity: String, response: ProtocolTvlResponse, window: SyncWindow) -> RecordIter {
    let mut by_date: HashMap<i64, JsonMap<String, JsonValue>> = HashMap::new();
    for (chain, series) in &response.chain_tvls {
        for point in &series.tvl {
            let (Some(at), Some(value)) = (
                point.date.as_ref().and_then(DateCell::to_utc),
                point.total_liquidity_usd.as_ref().and_then(NumberCell::as_f64),
            ) else {
                continue;
            };
            by_date
                .entry(at.timestamp())
                .or_default()
                .insert(chain.clone(), json!(value));
        }
    }

    Box::new(response.tvl.into_iter().filter_map(move |point| {
        let observed_at = point.date.as_ref()?.to_utc()?;
        if !window.contains(observed_at) || entity.is_empty() {
            return None;
        }
        let value = point.total_liquidity_usd.as_ref().and_then(NumberCell::as_f64)?;
        let payload = by_date
            .remove(&observed_at.timestamp())
            .map(|chains| json!({ "chain_tvls": chains }));
        Some(Record {
            entity: entity.clone(),
            observed_at,
            source: TVL_SOURCE_TAG.to_string(),
            kind: SourceKind::ProtocolTvl,
            resolution: window.resolution(),
            value,
            payload,
        })
    }))
}

#[derive(Debug, Clone)]
pub struct WarehouseAdapter {
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseRow {
    pub date: Option<DateCell>,
    pub volume: Option<NumberCell>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseResponse {
    #[serde(default)]
    pub rows: Vec<WarehouseRow>,
}

impl WarehouseAdapter {
    pub fn query_template(exchange: &str, historical: bool) -> String {
        if historical {
            exchange.to_string()
        } else {
            format!("{exchange}_bydate")
        }
    }
}

#[async_trait]
impl ProviderAdapter for WarehouseAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::AnalyticsWarehouse
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        request: &FetchRequest<'_>,
    ) -> Result<RecordIter, ProviderError> {
        let Some(exchange) = request.exchange else {
            return Err(ProviderError::InvalidRequest(
                "warehouse request without an exchange query template".into(),
            ));
        };
        let url = format!("{}/query", self.base_url);

        let body = json!({
            "query": Self::query_template(exchange, request.historical),
            "date_from": request.window.date_from().format("%Y-%m-%d %H:%M:%S").to_string(),
            "date_to": request.window.date_to().format("%Y-%m-%d %H:%M:%S").to_string(),
            "resolution": request.window.resolution().as_str(),
            "addresses": request.batch.references().collect::<Vec<_>>(),
        });
        let mut req = http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response: WarehouseResponse = http.send_json(self.kind().as_str(), req).await?;
        Ok(map_warehouse_rows(
            response.rows,
            ReferenceIndex::from_batch(request.batch),
            exchange,
            request.window.resolution(),
        ))
    }
}

/// Source tag for warehouse rows. Hourly rows carry the bare exchange name;
/// coarser rows are suffixed with their resolution so the hourly, 4h and
/// daily series of one exchange never share a dedup key.
pub fn warehouse_source_tag(exchange: &str, resolution: Resolution) -> String {
    match resolution {
        Resolution::Hour => exchange.to_string(),
        coarser => format!("{exchange}@{}", coarser.as_str()),
    }
}

pub fn map_warehouse_rows(
    rows: Vec<WarehouseRow>,
    index: ReferenceIndex,
    exchange: &str,
    resolution: Resolution,
) -> RecordIter {
    let source = warehouse_source_tag(exchange, resolution);
    Box::new(rows.into_iter().filter_map(move |row| {
        let entity = index.resolve(row.address.as_deref()?)?;
        let observed_at = row.date.as_ref()?.to_utc()?;
        let value = row.volume.as_ref()?.as_f64()?;
        Some(Record {
            entity: entity.to_string(),
            observed_at,
            source: source.clone(),
            kind: SourceKind::AnalyticsWarehouse,
            resolution,
            value,
            payload: None,
        })
    }))
}

#[derive(Debug, Clone)]
pub struct StreamingIndexAdapter {
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRef {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenDayData {
    #[serde(default)]
    pub id: Option<String>,
    /// Seconds since epoch.
    pub date: Option<i64>,
    pub volume: Option<NumberCell>,
    pub token: Option<TokenRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenDayDatas {
    #[serde(default, rename = "tokenDayDatas")]
    pub token_day_datas: Vec<TokenDayData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphResponse {
    #[serde(default)]
    pub data: TokenDayDatas,
    #[serde(default)]
    pub errors: Vec<JsonValue>,
}

#[async_trait]
impl ProviderAdapter for StreamingIndexAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::StreamingIndex
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        request: &FetchRequest<'_>,
    ) -> Result<RecordIter, ProviderError> {
        let tokens = request.batch.references().collect::<Vec<_>>();
        let mut rows = Vec::new();
        let mut last_id = String::new();
        loop {
            let body = json!({
                "query": TOKEN_DAY_DATAS_QUERY,
                "variables": {
                    "first": STREAMING_PAGE_SIZE,
                    "dateFrom": request.window.date_from().timestamp(),
                    "tokens": tokens,
                    "lastId": last_id,
                },
            });
            let req = http.post(&self.base_url).json(&body);
            let response: GraphResponse = http.send_json(self.kind().as_str(), req).await?;
            if let Some(first) = response.errors.first() {
                return Err(ProviderError::Decode {
                    url: self.base_url.clone(),
                    message: format!("graphql error: {first}"),
                });
            }

            let page = response.data.token_day_datas;
            let cursor = next_page_cursor(&page, STREAMING_PAGE_SIZE);
            rows.extend(page);
            match cursor {
                Some(id) => last_id = id,
                None => break,
            }
        }
        debug!(rows = rows.len(), "token day data fetched");

        Ok(map_token_day_datas(
            rows,
            ReferenceIndex::from_batch(request.batch),
            *request.window,
        ))
    }
}

/// Cursor for the next `id_gt` page, or `None` once a short page came back.
pub fn next_page_cursor(page: &[TokenDayData], page_size: usize) -> Option<String> {
    if page.len() < page_size {
        return None;
    }
    page.last()?.id.clone()
}

pub fn map_token_day_datas(
    rows: Vec<TokenDayData>,
    index: ReferenceIndex,
    window: SyncWindow,
) -> RecordIter {
    Box::new(rows.into_iter().filter_map(move |row| {
        let entity = index.resolve(row.token.as_ref()?.id.as_deref()?)?;
        let millis = row.date?.checked_mul(1000)?;
        let observed_at = DateTime::from_timestamp_millis(millis)?;
        if !window.contains(observed_at) {
            return None;
        }
        let value = row.volume.as_ref()?.as_f64()?;
        Some(Record {
            entity: entity.to_string(),
            observed_at,
            source: STREAMING_SOURCE_TAG.to_string(),
            kind: SourceKind::StreamingIndex,
            resolution: window.resolution(),
            value,
            payload: None,
        })
    }))
}
