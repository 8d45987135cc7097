pub mod gpio;
pub mod usart;
