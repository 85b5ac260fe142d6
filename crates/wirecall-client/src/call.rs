use tokio::sync::oneshot;
use wirecall_common::{CallId, Invocation, Result, TypedValue};

/// One outstanding call on a connection.
///
/// Completion consumes the call, so it can finish only once; whoever holds
/// the receiver returned by [`Call::new`] is woken with the outcome.
#[derive(Debug)]
pub struct Call {
    id: CallId,
    param: Invocation,
    done: oneshot::Sender<Result<TypedValue>>,
}

impl Call {
    pub fn new(id: CallId, param: Invocation) -> (Self, oneshot::Receiver<Result<TypedValue>>) {
        let (done, rx) = oneshot::channel();
        (Self { id, param, done }, rx)
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn param(&self) -> &Invocation {
        &self.param
    }

    pub fn set_value(self, value: TypedValue) {
        // the caller may have given up waiting
        let _ = self.done.send(Ok(value));
    }

    pub fn set_error(self, err: wirecall_common::RpcError) {
        let _ = self.done.send(Err(err));
    }

    pub(crate) fn complete(self, result: Result<TypedValue>) {
        let _ = self.done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirecall_common::RpcError;

    #[tokio::test]
    async fn test_set_value_wakes_waiter() {
        let (call, rx) = Call::new(3, Invocation::new("m", vec![]));
        assert_eq!(call.id(), 3);
        call.set_value(TypedValue::of(9i32));
        assert_eq!(rx.await.unwrap().unwrap(), TypedValue::of(9i32));
    }

    #[tokio::test]
    async fn test_set_error_wakes_waiter() {
        let (call, rx) = Call::new(4, Invocation::new("m", vec![]));
        call.set_error(RpcError::ConnectionClosed);
        assert!(matches!(rx.await.unwrap(), Err(RpcError::ConnectionClosed)));
    }

    #[test]
    fn test_completion_after_waiter_dropped() {
        let (call, rx) = Call::new(5, Invocation::new("m", vec![]));
        drop(rx);
        call.set_value(TypedValue::void());
    }
}
