//! Key layout shared by every volatile backend.
//!
//! The layout is part of the deployment contract: a running engine and any
//! external tooling inspecting the same Redis must agree on it.

/// Per-chat FIFO of message ids awaiting inclusion in a batch.
pub fn pending(chat_id: i64) -> String {
    format!("chat:{chat_id}:pending_batch")
}

/// Per-chat flush lease.
pub fn lock(chat_id: i64) -> String {
    format!("lock:chat:{chat_id}")
}

/// Client idempotency entry, value is the ASCII-decimal message id.
pub fn idempotency(key: &str) -> String {
    format!("idemp:{key}")
}

/// Most recently committed root for a chat, raw 32 bytes.
pub fn latest_root(chat_id: i64) -> String {
    format!("chat:{chat_id}:latest_root")
}

#[cfg(test)]
mod tests {
    #[test]
    fn key_layout_is_stable() {
        assert_eq!(super::pending(7), "chat:7:pending_batch");
        assert_eq!(super::lock(7), "lock:chat:7");
        assert_eq!(super::idempotency("K"), "idemp:K");
        assert_eq!(super::latest_root(7), "chat:7:latest_root");
    }
}
