use std::io::Write;

/// Abstract the host environment so pools and commands can be tested
pub trait Host: Send + Sync {
    // where results go (e.g., stdout)
    fn output(&mut self) -> impl Write;

    // where diagnostics outside the logger go (e.g., stderr)
    fn error(&mut self) -> impl Write;

    /// Terminate the process. Test hosts record the code and return instead.
    fn exit(&mut self, code: i32);
}

/// Test host that captures output and exit codes
#[cfg(test)]
#[derive(Debug, Default)]
pub struct TestHost {
    pub output_buf: Vec<u8>,
    pub error_buf: Vec<u8>,
    pub exit_code: Option<i32>,
}

#[cfg(test)]
impl Host for TestHost {
    fn output(&mut self) -> impl Write {
        &mut self.output_buf
    }

    fn error(&mut self) -> impl Write {
        &mut self.error_buf
    }

    fn exit(&mut self, code: i32) {
        self.exit_code = Some(code);
    }
}
