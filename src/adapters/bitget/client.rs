//! REST client for a Bitget-compatible futures gateway.
//!
//! The gateway terminates request signing; this client authenticates with
//! an access-key header pair. Error bodies are surfaced verbatim so the
//! classifier can pattern-match gateway messages ("rate limit", "apikey",
//! ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{
    AccountData, Envelope, OrderDetailData, PlaceOrderData, PlaceOrderRequest, PositionData,
    TickerData,
};
use crate::ports::exchange::{
    ExchangeError, ExchangeOrder, ExchangePort, ExchangePosition, OrderSide,
};

#[derive(Debug, Clone)]
pub struct BitgetConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub passphrase: Option<String>,
    /// Settlement coin for the futures account.
    pub margin_coin: String,
    pub product_type: String,
    pub timeout: Duration,
}

impl Default for BitgetConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.bitget.com".to_string(),
            api_key: None,
            passphrase: None,
            margin_coin: "USDT".to_string(),
            product_type: "USDT-FUTURES".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitgetClient {
    config: BitgetConfig,
    http: Client,
}

impl BitgetClient {
    pub fn new() -> Result<Self, ExchangeError> {
        Self::with_config(BitgetConfig::default())
    }

    pub fn with_config(config: BitgetConfig) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExchangeError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req;
        if let Some(ref key) = self.config.api_key {
            req = req.header("ACCESS-KEY", key);
        }
        if let Some(ref passphrase) = self.config.passphrase {
            req = req.header("ACCESS-PASSPHRASE", passphrase);
        }
        req
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let response = self
            .auth(self.http.get(&url).query(query))
            .send()
            .await
            .map_err(map_transport)?;
        Self::unwrap_envelope(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let response = self
            .auth(self.http.post(&url).json(body))
            .send()
            .await
            .map_err(map_transport)?;
        Self::unwrap_envelope(response).await
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::Api(format!("Rate limit exceeded (429): {body}")));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Api(format!("unexpected gateway response ({status}): {e}: {body}"))
        })?;

        if !envelope.is_ok() {
            return Err(ExchangeError::Api(format!(
                "gateway error {}: {}",
                envelope.code, envelope.msg
            )));
        }
        envelope
            .data
            .ok_or_else(|| ExchangeError::Api("gateway returned empty data".into()))
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        vec![("productType", self.config.product_type.clone())]
    }
}

fn map_transport(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Network(format!("request timed out: {e}"))
    } else {
        ExchangeError::Network(format!("connection error: {e}"))
    }
}

fn side_param(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

#[async_trait]
impl ExchangePort for BitgetClient {
    async fn futures_balance(&self) -> Result<Decimal, ExchangeError> {
        let mut query = self.base_query();
        query.push(("marginCoin", self.config.margin_coin.clone()));
        let account: AccountData = self.get("/api/v2/mix/account/account", &query).await?;
        Ok(account.available)
    }

    async fn positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let mut query = self.base_query();
        if let Some(symbol) = symbol {
            query.push(("symbol", symbol.to_string()));
        }
        let data: Vec<PositionData> = self.get("/api/v2/mix/position/all-position", &query).await?;
        Ok(data.into_iter().map(PositionData::into_position).collect())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        reduce_only: bool,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let request = PlaceOrderRequest {
            symbol: symbol.to_string(),
            margin_coin: self.config.margin_coin.clone(),
            side: side_param(side).to_string(),
            order_type: "market".to_string(),
            size: size.to_string(),
            price: None,
            reduce_only: if reduce_only { "YES" } else { "NO" }.to_string(),
        };
        let placed: PlaceOrderData = self.post("/api/v2/mix/order/place-order", &request).await?;
        // Market orders fill immediately; fetch the detail for fill price.
        self.get_order(symbol, &placed.order_id).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let request = PlaceOrderRequest {
            symbol: symbol.to_string(),
            margin_coin: self.config.margin_coin.clone(),
            side: side_param(side).to_string(),
            order_type: "limit".to_string(),
            size: size.to_string(),
            price: Some(price.to_string()),
            reduce_only: "NO".to_string(),
        };
        let placed: PlaceOrderData = self.post("/api/v2/mix/order/place-order", &request).await?;
        self.get_order(symbol, &placed.order_id).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        #[derive(Serialize)]
        struct CancelRequest<'a> {
            symbol: &'a str,
            #[serde(rename = "orderId")]
            order_id: &'a str,
        }
        let _: PlaceOrderData = self
            .post(
                "/api/v2/mix/order/cancel-order",
                &CancelRequest { symbol, order_id },
            )
            .await?;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        let mut query = self.base_query();
        query.push(("symbol", symbol.to_string()));
        query.push(("orderId", order_id.to_string()));
        let detail: OrderDetailData = self.get("/api/v2/mix/order/detail", &query).await?;
        Ok(detail.into_order())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        #[derive(Serialize)]
        struct LeverageRequest<'a> {
            symbol: &'a str,
            #[serde(rename = "marginCoin")]
            margin_coin: &'a str,
            leverage: String,
        }
        #[derive(serde::Deserialize)]
        struct LeverageData {}
        let _: LeverageData = self
            .post(
                "/api/v2/mix/account/set-leverage",
                &LeverageRequest {
                    symbol,
                    margin_coin: &self.config.margin_coin,
                    leverage: leverage.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let mut query = self.base_query();
        query.push(("symbol", symbol.to_string()));
        let data: Vec<TickerData> = self.get("/api/v2/mix/market/ticker", &query).await?;
        data.first()
            .map(|t| t.last_price)
            .ok_or_else(|| ExchangeError::Api(format!("no ticker for {symbol}")))
    }

    fn min_order_size(&self, _symbol: &str) -> Decimal {
        dec!(0.001)
    }
}
