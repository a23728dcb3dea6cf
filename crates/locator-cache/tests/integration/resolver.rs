use std::time::Duration;

use locator_cache::config::ResolverConfig;
use locator_cache::resolver::HttpResolver;
use locator_cache::{ResolveError, Resolver};

use crate::{PresignServer, setup};

fn resolver_for(server: &PresignServer) -> HttpResolver {
    let config = ResolverConfig {
        url: Some(server.url()),
        timeout: Duration::from_millis(500),
        ..Default::default()
    };
    HttpResolver::from_config(&config).unwrap().unwrap()
}

#[tokio::test]
async fn test_resolves_key() {
    setup();
    let server = PresignServer::new().await;
    let resolver = resolver_for(&server);

    let locator = resolver.resolve("products/shoe 1.png").await.unwrap();
    assert_eq!(locator, PresignServer::locator("products/shoe 1.png"));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_status_errors() {
    setup();
    let server = PresignServer::new().await;
    let resolver = resolver_for(&server);

    assert_eq!(resolver.resolve("missing").await, Err(ResolveError::NotFound));
    assert_eq!(
        resolver.resolve("broken").await,
        Err(ResolveError::BadStatus(500))
    );
}

#[tokio::test]
async fn test_malformed_responses() {
    setup();
    let server = PresignServer::new().await;
    let resolver = resolver_for(&server);

    let result = resolver.resolve("garbage").await;
    assert!(matches!(result, Err(ResolveError::Malformed(_))), "{result:?}");

    let result = resolver.resolve("empty").await;
    assert!(matches!(result, Err(ResolveError::Malformed(_))), "{result:?}");
}

#[tokio::test]
async fn test_timeout() {
    setup();
    let server = PresignServer::new().await;
    let resolver = resolver_for(&server);

    let result = resolver.resolve("slow").await;
    assert!(matches!(result, Err(ResolveError::Transport(_))), "{result:?}");
}

#[tokio::test]
async fn test_unreachable() {
    setup();
    let url = {
        // bind and immediately release a port, so that nothing listens on it
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        format!("http://127.0.0.1:{port}/presign").parse().unwrap()
    };
    let resolver = HttpResolver::new(url, &ResolverConfig::default()).unwrap();

    let result = resolver.resolve("products/a.png").await;
    assert!(matches!(result, Err(ResolveError::Transport(_))), "{result:?}");
}

#[test]
fn test_no_endpoint_configured() {
    let resolver = HttpResolver::from_config(&ResolverConfig::default()).unwrap();
    assert!(resolver.is_none());
}
