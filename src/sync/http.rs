use tracing::debug;

use super::transport::{
    PullRequest, PullResponse, PushRequest, PushResponse, SyncTransport, TransportFuture,
};

/// HTTP implementation of the remote authority protocol: JSON POSTs against
/// the server's replicache-style push/pull endpoints.
pub struct HttpSyncTransport {
    client: reqwest::Client,
    push_url: String,
    pull_url: String,
}

impl HttpSyncTransport {
    /// `base_url` is the server origin, e.g. `https://chat.example.com`.
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            push_url: format!("{base}/api/replicache/push"),
            pull_url: format!("{base}/api/replicache/pull"),
        }
    }
}

impl SyncTransport for HttpSyncTransport {
    fn push(&self, request: PushRequest) -> TransportFuture<PushResponse> {
        let client = self.client.clone();
        let url = self.push_url.clone();
        Box::pin(async move {
            debug!(mutations = request.mutations.len(), "POST push");
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?;
            Ok(response.json::<PushResponse>().await?)
        })
    }

    fn pull(&self, request: PullRequest) -> TransportFuture<PullResponse> {
        let client = self.client.clone();
        let url = self.pull_url.clone();
        Box::pin(async move {
            debug!(cookie = ?request.cookie, "POST pull");
            let response = client
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?;
            Ok(response.json::<PullResponse>().await?)
        })
    }
}
