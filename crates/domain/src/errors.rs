//! 领域模型错误定义
//!
//! 客户端本地输入在进入时间线之前就在这里被拒绝。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 验证错误（本地输入格式不正确）
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 资源不存在错误
    #[error("资源不存在: {resource_type} ID {resource_id}")]
    ResourceNotFound {
        resource_type: String,
        resource_id: String,
    },

    /// 业务规则违反错误
    #[error("业务规则违反: {rule}")]
    BusinessRuleViolation { rule: String },
}

impl DomainError {
    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建资源不存在错误
    pub fn resource_not_found(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self::ResourceNotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// 创建业务规则违反错误
    pub fn business_rule_violation(rule: impl Into<String>) -> Self {
        Self::BusinessRuleViolation { rule: rule.into() }
    }

    /// 是否为本地输入验证错误
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationError { .. })
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
