//! 数据库仓储层
//!
//! - 仓储只负责数据持久化，领取与写入各自在单个事务内完成
//! - 使用 SQLx 原生查询，状态枚举以 varchar 存储
//! - 定义 trait 接口以支持 mock 测试

mod order_repo;
mod traits;

pub use order_repo::PgOrderStore;
pub use traits::*;
