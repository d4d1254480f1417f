//! Decision whether a render streams or is delivered whole.

/// Decides per request whether streaming is disabled.
///
/// Crawlers typically want the complete document; detecting them is left
/// to the embedding application.
pub trait StreamingPolicy: Send + Sync {
    /// Return `true` to buffer the whole render for this user agent.
    fn disable_streaming(&self, user_agent: Option<&str>) -> bool;
}

/// Stream every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysStream;

impl StreamingPolicy for AlwaysStream {
    fn disable_streaming(&self, _user_agent: Option<&str>) -> bool {
        false
    }
}

impl<F> StreamingPolicy for F
where
    F: Fn(Option<&str>) -> bool + Send + Sync,
{
    fn disable_streaming(&self, user_agent: Option<&str>) -> bool {
        self(user_agent)
    }
}
