use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use common::{Error, OrderConfirmation, OrderGateway, OrderKind, OrderRequest, Result};

use crate::rest::KrakenClient;

#[derive(Deserialize)]
struct AddOrderResult {
    descr: OrderDescr,
    #[serde(default)]
    txid: Vec<String>,
}

#[derive(Deserialize)]
struct OrderDescr {
    #[serde(default)]
    order: String,
}

#[derive(Deserialize)]
struct QueriedOrder {
    #[serde(default)]
    price: String,
    #[serde(default)]
    cost: String,
    #[serde(default)]
    vol_exec: String,
}

impl KrakenClient {
    /// Build the `AddOrder` form from an explicit request struct.
    /// Optional fields are included only when present.
    fn order_fields(request: &OrderRequest) -> Result<Vec<(&'static str, String)>> {
        if request.volume <= 0.0 {
            return Err(Error::OrderRejected(
                "order volume must be positive".to_string(),
            ));
        }
        if request.kind == OrderKind::Limit && request.price.is_none() {
            return Err(Error::OrderRejected(
                "limit orders require a price".to_string(),
            ));
        }

        let mut fields = vec![
            ("pair", request.pair.clone()),
            ("type", request.side.to_string()),
            ("ordertype", request.kind.to_string()),
            ("volume", request.volume.to_string()),
        ];
        if let Some(price) = request.price {
            fields.push(("price", price.to_string()));
        }
        if let Some(leverage) = request.leverage {
            fields.push(("leverage", leverage.to_string()));
        }
        if request.validate {
            fields.push(("validate", "true".to_string()));
        }
        Ok(fields)
    }

    /// Ask the exchange what actually filled. Market orders normally close
    /// immediately; when the lookup fails the caller falls back to the
    /// requested amounts.
    async fn query_fill(&self, txids: &[String]) -> Result<(f64, f64)> {
        let queried: HashMap<String, QueriedOrder> = self
            .private_post("QueryOrders", &[("txid", txids.join(","))])
            .await?;

        let mut cost = 0.0;
        let mut price = 0.0;
        let mut vol_exec = 0.0;
        for order in queried.values() {
            cost += order.cost.parse::<f64>().unwrap_or(0.0);
            vol_exec += order.vol_exec.parse::<f64>().unwrap_or(0.0);
            price = order.price.parse::<f64>().unwrap_or(price);
        }
        // Average over executed volume when the exchange reports it.
        if price == 0.0 && vol_exec > 0.0 {
            price = cost / vol_exec;
        }
        Ok((price, cost))
    }
}

#[async_trait]
impl OrderGateway for KrakenClient {
    async fn submit(&self, request: &OrderRequest) -> Result<OrderConfirmation> {
        let fields = Self::order_fields(request)?;

        debug!(
            pair = %request.pair,
            side = %request.side,
            kind = %request.kind,
            volume = request.volume,
            validate = request.validate,
            "Submitting order"
        );
        let placed: AddOrderResult = self.private_post("AddOrder", &fields).await?;

        let mut price = request.price.unwrap_or(0.0);
        let mut cost = price * request.volume;

        // Validate-only runs book nothing, so there is nothing to query.
        if !request.validate && !placed.txid.is_empty() {
            match self.query_fill(&placed.txid).await {
                Ok((fill_price, fill_cost)) if fill_cost > 0.0 => {
                    price = fill_price;
                    cost = fill_cost;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Fill lookup failed; reporting requested amounts");
                }
            }
        }

        Ok(OrderConfirmation {
            txid: placed.txid,
            pair: request.pair.clone(),
            side: request.side,
            volume: request.volume,
            price,
            cost,
            descr: placed.descr.order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderSide;

    #[test]
    fn market_order_fields_omit_optionals() {
        let request = OrderRequest::market("XETHZUSD", OrderSide::Buy, 0.5);
        let fields = KrakenClient::order_fields(&request).unwrap();
        assert_eq!(
            fields,
            vec![
                ("pair", "XETHZUSD".to_string()),
                ("type", "buy".to_string()),
                ("ordertype", "market".to_string()),
                ("volume", "0.5".to_string()),
            ]
        );
    }

    #[test]
    fn limit_order_includes_price_and_validate() {
        let mut request = OrderRequest::limit("XXBTZUSD", OrderSide::Sell, 1.25, 37500.0);
        request.validate = true;
        let fields = KrakenClient::order_fields(&request).unwrap();
        assert!(fields.contains(&("price", "37500".to_string())));
        assert!(fields.contains(&("validate", "true".to_string())));
    }

    #[test]
    fn non_positive_volume_is_rejected_locally() {
        let request = OrderRequest::market("XETHZUSD", OrderSide::Buy, 0.0);
        assert!(matches!(
            KrakenClient::order_fields(&request),
            Err(Error::OrderRejected(_))
        ));
    }

    #[test]
    fn limit_without_price_is_rejected_locally() {
        let mut request = OrderRequest::market("XETHZUSD", OrderSide::Buy, 1.0);
        request.kind = OrderKind::Limit;
        assert!(KrakenClient::order_fields(&request).is_err());
    }
}
