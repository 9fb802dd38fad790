// Exit codes; failures of the library map through `ggufmount::ErrorKind`
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAIL: i32 = 1;

/// Exit code for a failed command.
pub fn code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ggufmount::Error>()
        .map_or(EXIT_GENERIC_FAIL, ggufmount::Error::exit_code)
}
