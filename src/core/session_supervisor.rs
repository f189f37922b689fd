//! 会话监管：取消令牌与在途会话计数
//!
//! 持有根 CancellationToken，每个 Session 拿一个子 token；cancel_all（如 Ctrl+C）一次性打断所有在途会话，
//! 单个 token 的取消只影响对应会话。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理：取消令牌与在途数量
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    active: Arc<AtomicUsize>,
}

/// 在途会话登记；drop 时自动注销
#[derive(Debug)]
pub struct SessionTicket {
    token: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl SessionTicket {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 只取消这一个会话
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// 挂在外部 token（如 ShutdownManager）之下
    pub fn with_token(parent: CancellationToken) -> Self {
        Self {
            cancel_token: parent,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 为新会话登记并返回子 token
    pub fn begin(&self) -> SessionTicket {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionTicket {
            token: self.cancel_token.child_token(),
            active: Arc::clone(&self.active),
        }
    }

    /// 取消所有在途会话
    pub fn cancel_all(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_cancel_is_scoped() {
        let sup = SessionSupervisor::new();
        let a = sup.begin();
        let b = sup.begin();
        assert_eq!(sup.active_sessions(), 2);

        a.cancel();
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());

        drop(a);
        assert_eq!(sup.active_sessions(), 1);
    }

    #[test]
    fn test_cancel_all_reaches_children() {
        let sup = SessionSupervisor::new();
        let t = sup.begin();
        sup.cancel_all();
        assert!(sup.is_cancelled());
        assert!(t.token().is_cancelled());
    }
}
