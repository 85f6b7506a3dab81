//! Concrete on-disk records shared by the format modules.

mod attr;
mod gpt;
mod locator;

pub use attr::{AttributePayload, AttributeRecord};
pub use gpt::{GptEntry, GPT_ENTRY_SIZE};
pub use locator::{
    ParentLocatorEntry, PARENT_LOCATOR_SIZE, PLATFORM_CODE_WINDOWS_ABSOLUTE,
    PLATFORM_CODE_WINDOWS_RELATIVE,
};
