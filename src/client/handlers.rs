use futures_util::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A completed transcription of the user's speech.
#[derive(Clone, Debug)]
pub struct TranscriptionContext {
    pub transcript: String,
}

/// A cleaned response segment that has just been queued for speech.
#[derive(Clone, Debug)]
pub struct ResponseTextContext {
    pub text: String,
    /// Position of the segment within its response.
    pub segment_index: usize,
}

pub trait EventHandlerSimple<Args, S>: Send + Sync + 'static {
    fn call(&self, args: Args, state: Arc<S>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

impl<F, Fut, Args, S> EventHandlerSimple<Args, S> for F
where
    F: Fn(Args, Arc<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    Args: Send + 'static,
    S: Send + Sync + 'static,
{
    fn call(&self, args: Args, state: Arc<S>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(self(args, state))
    }
}

pub(crate) struct Handlers<S: Send + Sync + 'static> {
    pub(crate) on_transcription: Option<Arc<dyn EventHandlerSimple<TranscriptionContext, S>>>,
    pub(crate) on_response_text: Option<Arc<dyn EventHandlerSimple<ResponseTextContext, S>>>,
}

impl<S: Send + Sync + 'static> Default for Handlers<S> {
    fn default() -> Self {
        Self {
            on_transcription: None,
            on_response_text: None,
        }
    }
}

pub(crate) type Hook<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers with the user state already bound.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) transcription: Option<Hook<TranscriptionContext>>,
    pub(crate) response_text: Option<Hook<ResponseTextContext>>,
}

fn bind_handler<A, S>(handler: Arc<dyn EventHandlerSimple<A, S>>, state: Arc<S>) -> Hook<A>
where
    A: Send + 'static,
    S: Send + Sync + 'static,
{
    Arc::new(move |args| handler.call(args, state.clone()))
}

impl<S: Send + Sync + 'static> Handlers<S> {
    pub(crate) fn bind(self, state: Arc<S>) -> Hooks {
        Hooks {
            transcription: self.on_transcription.map(|h| bind_handler(h, state.clone())),
            response_text: self.on_response_text.map(|h| bind_handler(h, state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Seen {
        transcripts: StdMutex<Vec<String>>,
    }

    async fn record(ctx: TranscriptionContext, state: Arc<Seen>) {
        state.transcripts.lock().unwrap().push(ctx.transcript);
    }

    #[tokio::test]
    async fn async_fn_handlers_are_bound_to_state() {
        let state = Arc::new(Seen::default());
        let mut handlers: Handlers<Seen> = Handlers::default();
        handlers.on_transcription = Some(Arc::new(record));

        let hooks = handlers.bind(state.clone());
        assert!(hooks.response_text.is_none());
        let hook = hooks.transcription.unwrap();
        hook(TranscriptionContext {
            transcript: "turn left".to_string(),
        })
        .await;
        assert_eq!(*state.transcripts.lock().unwrap(), vec!["turn left".to_string()]);
    }
}
