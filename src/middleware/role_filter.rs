//! 角色工具过滤中间件
//!
//! 按请求上下文中的 user_role 收窄传给模型的工具集；默认规则：非 admin 看不到
//! 创建/变更技能的工具。只改本次请求，不落状态。

use std::collections::HashSet;

use async_trait::async_trait;

use crate::core::RequestContext;
use crate::middleware::{Middleware, ModelFuture, ModelHandler, ModelRequest};

pub struct RoleFilterMiddleware {
    admin_only: HashSet<String>,
}

impl RoleFilterMiddleware {
    pub fn new() -> Self {
        Self {
            admin_only: ["create_skill", "update_skill"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn with_admin_only(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.admin_only = names.into_iter().collect();
        self
    }
}

impl Default for RoleFilterMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for RoleFilterMiddleware {
    fn name(&self) -> &str {
        "role_filter"
    }

    fn wrap_model_call<'a>(
        &'a self,
        mut req: ModelRequest,
        ctx: &'a RequestContext,
        next: ModelHandler<'a>,
    ) -> ModelFuture<'a> {
        if ctx.user_role != "admin" {
            let before = req.tools.len();
            req.tools.retain(|t| !self.admin_only.contains(&t.name));
            if req.tools.len() != before {
                tracing::debug!(
                    user_role = %ctx.user_role,
                    removed = before - req.tools.len(),
                    "tools_filtered_by_role"
                );
            }
        }
        next.run(req)
    }
}
