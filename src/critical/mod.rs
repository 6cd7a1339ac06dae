pub mod critical_messages;
