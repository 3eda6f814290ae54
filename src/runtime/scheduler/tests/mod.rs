//! 加载调度器单元测试
//!
//! 测试就绪队列、I/O 预算调度和加载器的协作行为
