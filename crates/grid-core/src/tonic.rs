use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint};

fn url_wants_wait_connect(url: &url::Url) -> bool {
    url.query_pairs()
        .filter(|(k, v)| k == "wait-connect" && v == "1")
        .count()
        > 0
}

/// Turn a [url::Url] to a [Channel] if it can be parsed successfully.
/// It supports `grpc+unix:/path/to/socket`, as well as the regular schemes supported
/// by tonic, for example `grpc+http://[::1]:8000`.
/// It supports wait-connect=1 as a URL parameter, in which case we don't connect lazily.
pub async fn channel_from_url(url: &url::Url) -> Result<Channel, self::Error> {
    // Stringify the URL and remove the grpc+ prefix.
    // We can't use `url.set_scheme(rest)`, as it disallows
    // setting something http(s) that previously wasn't.
    let unprefixed_url_str = match url.to_string().strip_prefix("grpc+") {
        None => return Err(Error::MissingGRPCPrefix()),
        Some(url_str) => url_str.to_owned(),
    };

    if url.scheme() == "grpc+unix" {
        if url.host_str().is_some() {
            return Err(Error::HostSetForUnixSocket());
        }

        let connector = tower::service_fn({
            let url = url.clone();
            move |_: tonic::transport::Uri| UnixStream::connect(url.path().to_string().clone())
        });

        let channel = if url_wants_wait_connect(url) {
            Endpoint::from_static("http://[::]:50051")
                .connect_with_connector(connector)
                .await?
        } else {
            Endpoint::from_static("http://[::]:50051").connect_with_connector_lazy(connector)
        };

        return Ok(channel);
    }

    // ensure path is empty, not supported with gRPC.
    if !url.path().is_empty() {
        return Err(Error::PathMayNotBeSet());
    }

    // Use the regular tonic transport::Endpoint logic, but unprefixed_url_str,
    // as tonic doesn't know about grpc+http[s].
    let endpoint = Endpoint::try_from(unprefixed_url_str)?;
    let channel = if url_wants_wait_connect(url) {
        endpoint.connect().await?
    } else {
        endpoint.connect_lazy()
    };

    Ok(channel)
}

/// Errors occuring when trying to connect to a backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("grpc+ prefix is missing from URL")]
    MissingGRPCPrefix(),

    #[error("host may not be set for unix domain sockets")]
    HostSetForUnixSocket(),

    #[error("path may not be set")]
    PathMayNotBeSet(),

    #[error("transport error: {0}")]
    TransportError(tonic::transport::Error),
}

impl From<tonic::transport::Error> for Error {
    fn from(value: tonic::transport::Error) -> Self {
        Self::TransportError(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use url::Url;

    use super::channel_from_url;

    #[rstest]
    #[case::unix_socket("grpc+unix:///path/to/somewhere", true)]
    #[case::unix_wait_connect_0("grpc+unix:///path/to/somewhere?wait-connect=0", true)]
    #[case::unix_wait_connect_1_missing_path("grpc+unix:///path/to/somewhere?wait-connect=1", false)]
    #[case::unix_with_host_is_invalid("grpc+unix://host.example/path/to/somewhere", false)]
    #[case::ipv6_localhost_with_port("grpc+http://[::1]:12345", true)]
    #[case::http_host_without_port("grpc+http://localhost", true)]
    #[case::https_host_without_port("grpc+https://localhost", true)]
    #[case::http_host_with_path_is_invalid("grpc+http://localhost/some-path", false)]
    #[case::http_wait_connect_0("grpc+http://localhost?wait-connect=0", true)]
    #[case::http_wait_connect_1_unreachable_host("grpc+http://nonexist.invalid?wait-connect=1", false)]
    #[tokio::test]
    async fn channel_from_url_cases(#[case] uri_str: &str, #[case] is_ok: bool) {
        let url = Url::parse(uri_str).expect("must parse");
        assert_eq!(channel_from_url(&url).await.is_ok(), is_ok)
    }
}
