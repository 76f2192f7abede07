pub mod echo;
pub mod login;

pub use echo::EchoProtocol;
pub use login::LoginProtocol;
