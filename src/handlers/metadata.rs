//! Object resource fetches (`alt=json`)

use super::{parse_resource, serialize_resource, HandlerContext, OperationHandler};
use crate::errors::ProxyError;
use crate::exchange::Exchange;
use crate::types::PlaintextFacts;
use async_trait::async_trait;
use tracing::{debug, warn};

pub struct MetadataHandler;

#[async_trait]
impl OperationHandler for MetadataHandler {
    async fn on_request(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        // A field-filtered resource may omit the sidecar, so always fetch it whole.
        let query = &mut exchange.request.query;
        query.remove("fields");
        query.set("alt", "json");
        Ok(())
    }

    async fn on_response(
        &self,
        _ctx: &HandlerContext,
        exchange: &mut Exchange,
    ) -> Result<(), ProxyError> {
        let response = match exchange.response.as_mut() {
            Some(response) => response,
            None => return Ok(()),
        };
        if !response.is_success() {
            warn!(
                "Metadata fetch for {} returned {}, left untouched",
                exchange.request.path, response.status
            );
            return Ok(());
        }

        let mut resource = parse_resource(&response.body)?;
        match PlaintextFacts::from_resource(&resource) {
            Some(facts) => {
                debug!(
                    "Substituting plaintext size {} for {}",
                    facts.size, exchange.request.path
                );
                facts.apply_to(&mut resource);
                response.set_body(serialize_resource(resource));
            }
            None => debug!("{} carries no sidecar metadata", exchange.request.path),
        }
        Ok(())
    }
}
