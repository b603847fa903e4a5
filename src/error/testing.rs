#[cfg(any(test, feature = "pg_test"))]
/// # Panics
/// Panics if the result is `Ok` (operation succeeded when error was expected).
pub fn assert_error_sqlstate<T>(
    result: crate::ViewGraphResult<T>,
    expected_sqlstate: &str,
) {
    match result {
        Err(e) => {
            assert_eq!(
                e.sqlstate(),
                expected_sqlstate,
                "Expected SQLSTATE {expected_sqlstate}, got {}: {e}",
                e.sqlstate()
            );
        }
        Ok(_) => {
            panic!("Expected error with SQLSTATE {expected_sqlstate}, but operation succeeded");
        }
    }
}

#[cfg(any(test, feature = "pg_test"))]
/// # Panics
/// Panics if the result is `Ok` (operation succeeded when error was expected).
pub fn assert_error_contains<T>(
    result: crate::ViewGraphResult<T>,
    expected_substring: &str,
) {
    match result {
        Err(e) => {
            let message = e.to_string();
            assert!(
                message.contains(expected_substring),
                "Error message '{message}' does not contain '{expected_substring}'"
            );
        }
        Ok(_) => {
            panic!("Expected error containing '{expected_substring}', but operation succeeded");
        }
    }
}

#[cfg(any(test, feature = "pg_test"))]
/// Assert the run was rejected as a configuration error, before any DDL,
/// with `expected_substring` in the message.
///
/// # Panics
/// Panics if the result is `Ok` or the error is raised while executing.
pub fn assert_configuration_error<T>(
    result: crate::ViewGraphResult<T>,
    expected_substring: &str,
) {
    match result {
        Err(e) => {
            assert!(e.is_configuration(), "Expected a configuration error, got {e}");
            assert!(
                e.to_string().contains(expected_substring),
                "Error message '{e}' does not contain '{expected_substring}'"
            );
        }
        Ok(_) => {
            panic!("Expected configuration error containing '{expected_substring}', but operation succeeded");
        }
    }
}
