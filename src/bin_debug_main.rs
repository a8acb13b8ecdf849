use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use lowcord::{Authentication, HttpConfig, HttpEngine, RequestOptions, RetryConfig, Route};
use lowcord::http::Method as HttpMethod;

#[tokio::main]
async fn main() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .and(header("Authorization", "Bot sekrit"))
        .and(header("User-Agent", "DiscordBot (https://github.com/lowcord/lowcord, 0.1.0)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "1"})))
        .mount(&server)
        .await;

    let cfg = HttpConfig {
        base_url: server.uri(),
        retry: RetryConfig { max_attempts: 2, initial_delay_ms: 10, max_delay_ms: 50 },
        max_rate_limit_retries: 2,
        ..HttpConfig::default()
    };
    let engine = HttpEngine::new(cfg).unwrap();
    let auth = Authentication::Bot("sekrit".into());
    let res = engine.request(&Route::new(HttpMethod::GET, "/users/@me"), RequestOptions::authenticated(&auth)).await;
    println!("{:?}", res.map(|r| r.status()));
    for req in server.received_requests().await.unwrap() {
        println!("method={} path={} headers={:?}", req.method, req.url.path(), req.headers);
    }
}
