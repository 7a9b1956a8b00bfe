use super::{
    ConfigError, ControllerError, DataError, EngineError, SchedulerError, StoreError,
};

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for EngineError {
    fn from(message: &'static str) -> Self {
        EngineError::TestExpectation { message }
    }
}

impl From<String> for EngineError {
    fn from(value: String) -> Self {
        EngineError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for SchedulerError {
    fn from(message: &'static str) -> Self {
        SchedulerError::TestExpectation { message }
    }
}

impl From<String> for SchedulerError {
    fn from(value: String) -> Self {
        SchedulerError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for StoreError {
    fn from(message: &'static str) -> Self {
        StoreError::TestExpectation { message }
    }
}

impl From<String> for StoreError {
    fn from(value: String) -> Self {
        StoreError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for DataError {
    fn from(message: &'static str) -> Self {
        DataError::TestExpectation { message }
    }
}

impl From<String> for DataError {
    fn from(value: String) -> Self {
        DataError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ControllerError {
    fn from(message: &'static str) -> Self {
        ControllerError::TestExpectation { message }
    }
}

impl From<String> for ControllerError {
    fn from(value: String) -> Self {
        ControllerError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
