use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};
use warp::{
    http::StatusCode,
    hyper::body::Bytes,
    reply::{self, Response},
    Filter, Rejection, Reply,
};

use crate::{
    analytics::ReportClient,
    report::{build_request, ReportQuery},
};

/// Read-only state shared by every request.
pub(crate) struct ReportContext<C> {
    pub(crate) client: C,
    /// Property resource name, `properties/{id}`.
    pub(crate) property: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) async fn serve<C>(context: ReportContext<C>, addr: SocketAddr)
where
    C: ReportClient + Send + Sync + 'static,
{
    info!("Running on http://{addr}/report");
    warp::serve(routes(Arc::new(context))).run(addr).await;
}

pub(crate) fn routes<C>(
    context: Arc<ReportContext<C>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone
where
    C: ReportClient + Send + Sync + 'static,
{
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["POST"])
        .allow_headers(vec!["content-type"]);

    warp::path("report")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(warp::any().map(move || context.clone()))
        .and_then(report::<C>)
        .with(cors)
}

async fn report<C>(body: Bytes, context: Arc<ReportContext<C>>) -> Result<Response, Infallible>
where
    C: ReportClient,
{
    match run_report(&body, &context).await {
        Ok(report) => Ok(reply::json(&report).into_response()),
        Err(e) => {
            error!("GA4 API Error: {e:#}");
            let body = ErrorResponse {
                error: format!("{e:#}"),
            };
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            let error_reply = reply::with_status(reply::json(&body), status);
            Ok(error_reply.into_response())
        }
    }
}

async fn run_report<C>(body: &[u8], context: &ReportContext<C>) -> Result<Value>
where
    C: ReportClient,
{
    let query = ReportQuery::from_slice(body)?;
    let request = build_request(&query, &context.property);
    let report = context.client.run_report(&request).await?;
    info!(
        "Served report for {} ({} to {})",
        context.property, query.start_date, query.end_date
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{future::Future, sync::Mutex};

    use anyhow::anyhow;
    use serde_json::json;

    use super::*;
    use crate::report::{FilterExpression, RunReportRequest};

    struct StaticClient {
        result: Result<Value, String>,
        seen: Mutex<Vec<RunReportRequest>>,
    }

    impl StaticClient {
        fn context(result: Result<Value, String>) -> Arc<ReportContext<Self>> {
            Arc::new(ReportContext {
                client: Self {
                    result,
                    seen: Mutex::new(Vec::new()),
                },
                property: "properties/1234".to_string(),
            })
        }
    }

    impl ReportClient for StaticClient {
        fn run_report(
            &self,
            request: &RunReportRequest,
        ) -> impl Future<Output = Result<Value>> + Send {
            self.seen.lock().unwrap().push(request.clone());
            let result = self.result.clone().map_err(|message| anyhow!(message));
            async move { result }
        }
    }

    fn sample_report() -> Value {
        json!({
            "dimensionHeaders": [{"name": "country"}],
            "metricHeaders": [{"name": "activeUsers", "type": "TYPE_INTEGER"}],
            "rows": [{
                "dimensionValues": [{"value": "United States"}],
                "metricValues": [{"value": "42"}]
            }],
            "rowCount": 1,
            "kind": "analyticsData#runReport"
        })
    }

    #[tokio::test]
    async fn report_passes_through() {
        let context = StaticClient::context(Ok(sample_report()));
        let res = warp::test::request()
            .method("POST")
            .path("/report")
            .json(&json!({
                "startDate": "2024-01-01",
                "endDate": "2024-01-31",
                "dimensions": ["country"],
                "metrics": ["activeUsers"],
                "filters": [{"field": "country", "value": "US"}],
                "limit": 0
            }))
            .reply(&routes(context.clone()))
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, sample_report());

        let seen = context.client.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].property, "properties/1234");
        assert_eq!(seen[0].limit, Some(0));
        assert_eq!(seen[0].offset, None);
        assert!(matches!(
            seen[0].dimension_filter,
            Some(FilterExpression::AndGroup(ref group)) if group.expressions.len() == 1
        ));
    }

    #[tokio::test]
    async fn upstream_failure() {
        let message = "PERMISSION_DENIED: User does not have sufficient permissions.";
        let context = StaticClient::context(Err(message.to_string()));
        let res = warp::test::request()
            .method("POST")
            .path("/report")
            .json(&json!({
                "startDate": "2024-01-01",
                "endDate": "2024-01-31",
                "dimensions": ["country"],
                "metrics": ["activeUsers"]
            }))
            .reply(&routes(context))
            .await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, json!({ "error": message }));
    }

    #[tokio::test]
    async fn malformed_query() {
        let context = StaticClient::context(Ok(sample_report()));
        let res = warp::test::request()
            .method("POST")
            .path("/report")
            .body(r#"{"startDate": "2024-01-01", "dimensions": ["country"]}"#)
            .reply(&routes(context.clone()))
            .await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("invalid argument: malformed report query: "));
        assert!(message.contains("missing field `endDate`"));
        assert!(context.client.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_json() {
        let context = StaticClient::context(Ok(sample_report()));
        let res = warp::test::request()
            .method("POST")
            .path("/report")
            .body("startDate=2024-01-01")
            .reply(&routes(context))
            .await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn only_post_is_routed() {
        let context = StaticClient::context(Ok(sample_report()));
        let filter = routes(context);

        let res = warp::test::request()
            .method("GET")
            .path("/report")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

        let res = warp::test::request()
            .method("POST")
            .path("/reports")
            .body("{}")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_any_origin() {
        let context = StaticClient::context(Ok(sample_report()));
        let filter = routes(context);

        let res = warp::test::request()
            .method("OPTIONS")
            .path("/report")
            .header("origin", "https://dashboard.example.com")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("access-control-allow-origin"));

        let res = warp::test::request()
            .method("POST")
            .path("/report")
            .header("origin", "https://dashboard.example.com")
            .json(&json!({
                "startDate": "2024-01-01",
                "endDate": "2024-01-31",
                "dimensions": ["country"],
                "metrics": ["activeUsers"]
            }))
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("access-control-allow-origin"));
    }
}
