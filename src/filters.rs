//! In/out filter chain the dispatcher runs requests and responses through
//! (spec §4.G). Filters run in registration order; an in-filter can short
//! circuit the chain by returning a response directly.

use async_trait::async_trait;
use http::{Request, Response};

use crate::error::DispatchError;

pub type Body = bytes::Bytes;

#[async_trait]
pub trait InFilter: Send + Sync {
    /// Inspect or rewrite the request. Returning `Some(response)` short
    /// circuits the remaining chain and the route handler itself.
    async fn apply(&self, req: &mut Request<Body>) -> Result<Option<Response<Body>>, DispatchError>;
}

#[async_trait]
pub trait OutFilter: Send + Sync {
    async fn apply(&self, resp: &mut Response<Body>) -> Result<(), DispatchError>;
}

#[derive(Default)]
pub struct FilterChain {
    in_filters: Vec<Box<dyn InFilter>>,
    out_filters: Vec<Box<dyn OutFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_in(&mut self, filter: Box<dyn InFilter>) {
        self.in_filters.push(filter);
    }

    pub fn push_out(&mut self, filter: Box<dyn OutFilter>) {
        self.out_filters.push(filter);
    }

    /// Run the in-filter chain; returns `Some(response)` if a filter short
    /// circuited.
    pub async fn run_in(
        &self,
        req: &mut Request<Body>,
    ) -> Result<Option<Response<Body>>, DispatchError> {
        for filter in &self.in_filters {
            if let Some(response) = filter.apply(req).await? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    pub async fn run_out(&self, resp: &mut Response<Body>) -> Result<(), DispatchError> {
        for filter in &self.out_filters {
            filter.apply(resp).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod filters_test {
    use super::*;
    use http::StatusCode;

    struct AddHeader;

    #[async_trait]
    impl InFilter for AddHeader {
        async fn apply(
            &self,
            req: &mut Request<Body>,
        ) -> Result<Option<Response<Body>>, DispatchError> {
            req.headers_mut()
                .insert("x-seen", "1".parse().unwrap());
            Ok(None)
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl InFilter for ShortCircuit {
        async fn apply(
            &self,
            _req: &mut Request<Body>,
        ) -> Result<Option<Response<Body>>, DispatchError> {
            Ok(Some(
                Response::builder()
                    .status(StatusCode::FORBIDDEN)
                    .body(Body::new())
                    .unwrap(),
            ))
        }
    }

    #[tokio::test]
    async fn in_filters_run_in_order() {
        let mut chain = FilterChain::new();
        chain.push_in(Box::new(AddHeader));
        let mut req = Request::builder().body(Body::new()).unwrap();
        let result = chain.run_in(&mut req).await.unwrap();
        assert!(result.is_none());
        assert_eq!(req.headers().get("x-seen").unwrap(), "1");
    }

    #[tokio::test]
    async fn short_circuit_stops_remaining_filters() {
        let mut chain = FilterChain::new();
        chain.push_in(Box::new(ShortCircuit));
        chain.push_in(Box::new(AddHeader));
        let mut req = Request::builder().body(Body::new()).unwrap();
        let result = chain.run_in(&mut req).await.unwrap();
        assert!(result.is_some());
        assert!(req.headers().get("x-seen").is_none());
    }
}
